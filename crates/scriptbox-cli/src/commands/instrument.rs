//! Instrument command: print the program as the sandbox would receive it

use crate::args::InstrumentArgs;
use anyhow::{Context, Result};
use colored::*;
use scriptbox_core::{Instrumented, RunnerConfig, instrument};

pub async fn execute(args: InstrumentArgs) -> Result<i32> {
    let config = RunnerConfig::load(args.config.as_deref())?;
    let source = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("could not read {}", args.file.display()))?;

    let result = instrument(&source, &config.instrument_options());
    print!("{}", result.code);
    if !result.code.ends_with('\n') {
        println!();
    }
    eprintln!("{}", summary(&result));
    Ok(0)
}

/// One-line description of what the instrumenter did
pub fn summary(result: &Instrumented) -> String {
    let graphics = if result.needs_graphics {
        ", uses plotting"
    } else {
        ""
    };
    match &result.passthrough {
        Some(reason) => format!(
            "{} {}{}",
            "passthrough:".yellow().bold(),
            reason,
            graphics
        ),
        None => format!(
            "{} {} call-site(s) rewritten{}",
            "instrumented:".green().bold(),
            result.rewrites,
            graphics
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_core::InstrumentOptions;

    #[test]
    fn test_summary_counts_rewrites() {
        colored::control::set_override(false);
        let result = instrument("x = input()\nprint(x)\n", &InstrumentOptions::default());
        assert_eq!(summary(&result), "instrumented: 1 call-site(s) rewritten");
    }

    #[test]
    fn test_summary_names_passthrough_reason() {
        colored::control::set_override(false);
        let result = instrument("def __sleep__(x):\n    pass\n", &InstrumentOptions::default());
        let text = summary(&result);
        assert!(text.starts_with("passthrough: program uses reserved name"), "{}", text);
    }
}
