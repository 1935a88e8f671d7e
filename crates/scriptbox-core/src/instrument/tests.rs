use super::*;

fn run(source: &str) -> Instrumented {
    instrument(source, &InstrumentOptions::default())
}

fn body(source: &str) -> String {
    let result = run(source);
    assert!(result.instrumented, "expected instrumentation: {:?}", result.passthrough);
    result
        .code
        .strip_prefix("async def __user_main__():\n")
        .expect("entry point header")
        .to_string()
}

#[test]
fn test_input_call_is_rewritten_and_wrapped() {
    let result = run("name = input(\"Name? \")\nprint(name)\n");
    assert!(result.instrumented);
    assert_eq!(result.rewrites, 1);
    assert_eq!(
        result.code,
        "async def __user_main__():\n    name = await __await_input__(\"Name? \")\n    print(name)\n\n"
    );
}

#[test]
fn test_time_sleep_is_rewritten() {
    let code = body("import time\ntime.sleep(0.5)\ntime . sleep (1)\n");
    assert!(code.contains("    await __sleep__(0.5)"));
    assert!(code.contains("    await __sleep__(1)"));
}

#[test]
fn test_bare_sleep_needs_from_import() {
    let without = body("sleep(1)\n");
    assert!(without.contains("sleep(1)"));
    assert!(!without.contains("__sleep__"));

    let with = body("from time import perf_counter, sleep\nsleep(1)\n");
    assert!(with.contains("await __sleep__(1)"));
}

#[test]
fn test_word_boundaries() {
    let code = body("user_input(1)\ninputs(2)\nobj.input(3)\nx = (input)\n");
    assert!(!code.contains("__await_input__"));
    assert_eq!(run("user_input(1)\n").rewrites, 0);
}

#[test]
fn test_whitespace_before_paren() {
    let code = body("x = input   (\"a\")\n");
    assert!(code.contains("x = await __await_input__(\"a\")"));
}

#[test]
fn test_strings_and_comments_are_left_alone() {
    let source = "print(\"input(\")\n# input() here\ns = 'time.sleep(1)'\nx = input()  # input()\n";
    let result = run(source);
    assert_eq!(result.rewrites, 1);
    assert!(result.code.contains("print(\"input(\")"));
    assert!(result.code.contains("# input() here"));
    assert!(result.code.contains("'time.sleep(1)'"));
    assert!(result.code.contains("x = await __await_input__()  # input()"));
}

#[test]
fn test_nested_calls_are_all_rewritten() {
    let code = body("n = int(input(\"n? \"))\nprint(input(), input())\n");
    assert!(code.contains("n = int(await __await_input__(\"n? \"))"));
    assert!(code.contains("print(await __await_input__(), await __await_input__())"));
}

#[test]
fn test_multiline_string_lines_are_not_indented() {
    let source = "text = \"\"\"first\nsecond\n\"\"\"\nprint(text)\n";
    let code = body(source);
    assert_eq!(
        code,
        "    text = \"\"\"first\nsecond\n\"\"\"\n    print(text)\n\n"
    );
}

#[test]
fn test_tabs_are_expanded() {
    let code = body("for i in range(2):\n\tprint(input())\n");
    assert!(code.contains("        print(await __await_input__())"));
}

#[test]
fn test_empty_body_gets_pass() {
    let result = run("# just a comment\n");
    assert!(result.instrumented);
    assert!(result.code.ends_with("    pass\n"));
}

#[test]
fn test_async_function_may_await() {
    let code = body("async def ask():\n    return input()\n\nprint(await ask())\n");
    assert!(code.contains("return await __await_input__()"));
}

#[test]
fn test_synchronous_function_passes_through() {
    let source = "def ask():\n    return input(\"? \")\n\nprint(ask())\n";
    let result = run(source);
    assert!(!result.instrumented);
    assert_eq!(result.code, source);
    assert_eq!(result.passthrough, Some(Passthrough::SynchronousScope { line: 2 }));
}

#[test]
fn test_call_after_function_body_is_fine() {
    let code = body("def helper(x):\n    return x * 2\n\nprint(helper(int(input())))\n");
    assert!(code.contains("print(helper(int(await __await_input__())))"));
}

#[test]
fn test_lambda_passes_through() {
    let result = run("ask = lambda: input()\n");
    assert!(!result.instrumented);
    assert_eq!(result.passthrough, Some(Passthrough::SynchronousScope { line: 1 }));
}

#[test]
fn test_class_body_passes_through() {
    let result = run("class Config:\n    name = input()\n");
    assert!(!result.instrumented);
}

#[test]
fn test_reserved_name_passes_through() {
    let result = run("def __sleep__(x):\n    pass\n");
    assert!(!result.instrumented);
    assert_eq!(
        result.passthrough,
        Some(Passthrough::ReservedName("__sleep__".into()))
    );
}

#[test]
fn test_defining_input_is_not_a_call_site() {
    let result = run("async def input(prompt):\n    return 'x'\n");
    assert!(result.instrumented);
    assert_eq!(result.rewrites, 0);
}

#[test]
fn test_idempotent() {
    let once = run("x = input()\nimport time\ntime.sleep(1)\n");
    let twice = run(&once.code);
    assert!(twice.instrumented);
    assert_eq!(twice.passthrough, None);
    assert_eq!(twice.rewrites, 0);
    assert_eq!(twice.code, once.code);
    assert_eq!(twice.code.matches("await await").count(), 0);
    assert_eq!(twice.code.matches("__await_input__").count(), 1);
}

#[test]
fn test_existing_wrapper_gets_remaining_call_sites_rewritten() {
    let source = "async def __user_main__():\n    a = await __await_input__()\n    b = input()\n";
    let result = run(source);
    assert!(result.instrumented);
    assert_eq!(result.rewrites, 1);
    assert_eq!(
        result.code,
        "async def __user_main__():\n    a = await __await_input__()\n    b = await __await_input__()\n"
    );
}

#[test]
fn test_entry_point_name_elsewhere_is_still_reserved() {
    let result = run("x = 1\nasync def __user_main__():\n    pass\n");
    assert!(!result.instrumented);
    assert_eq!(
        result.passthrough,
        Some(Passthrough::ReservedName("__user_main__".into()))
    );
}

#[test]
fn test_needs_graphics() {
    assert!(needs_graphics("import matplotlib.pyplot as plt\n"));
    assert!(needs_graphics("x = 1\nfrom matplotlib import pyplot\n"));
    assert!(needs_graphics("  import matplotlib\n"));
    assert!(needs_graphics("pyplot.plot([1, 2])\n"));
    assert!(!needs_graphics("import math\nprint('matplotlib')\n"));
    assert!(!needs_graphics("import matplotlibx\n"));
    assert!(run("import matplotlib.pyplot as plt\n").needs_graphics);
}
