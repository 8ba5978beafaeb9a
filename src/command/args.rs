//! Argument vector construction
//!
//! Turns a [`CommandSpec`] into the argv handed to the OS: scripts are
//! wrapped in `sh -c`, inline commands are expanded, split on whitespace
//! with shell-style quoting and optionally given a `--namespace`.

use super::CommandSpec;
use crate::Error;

/// Shell used to run script bodies
pub const SCRIPT_SHELL: &str = "sh";

/// Build the argv for `spec`
///
/// `lookup` resolves `$VAR`/`${VAR}` in inline commands; variables it doesn't
/// know expand to the empty string.
pub fn build_argv<F>(spec: &CommandSpec, namespace: &str, lookup: F) -> Result<Vec<String>, Error>
where
    F: FnMut(&str) -> Option<String>,
{
    spec.validate()?;

    if let Some(script) = spec.script_body() {
        return Ok(vec![SCRIPT_SHELL.to_string(), "-c".to_string(), script.to_string()]);
    }

    let command = spec.command_line().unwrap_or_default();
    let expanded = expand_env(command, lookup);
    let mut argv = tokenize(&expanded)?;
    if argv.is_empty() {
        return Err(Error::validation_for_field(
            "command",
            format!("command {command:?} is empty after expansion"),
        ));
    }

    if spec.namespaced && namespace_flag(&argv)?.is_none_or(|ns| ns.is_empty()) {
        argv.push("--namespace".to_string());
        argv.push(namespace.to_string());
    }
    Ok(argv)
}

/// Expand `$VAR` and `${VAR}` references
pub fn expand_env<F>(text: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    shellexpand::env_with_context_no_errors(text, |name| Some(lookup(name).unwrap_or_default()))
        .into_owned()
}

/// Split a command line into words
///
/// Whitespace separates words except inside single or double quotes; a
/// backslash outside single quotes escapes the next character. An unclosed
/// quote or a trailing backslash is an error.
pub fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' && !in_single {
            escaped = true;
            in_word = true;
            continue;
        }
        if c == '\'' && !in_double {
            in_single = !in_single;
            in_word = true;
            continue;
        }
        if c == '"' && !in_single {
            in_double = !in_double;
            in_word = true;
            continue;
        }
        if c.is_whitespace() && !in_single && !in_double {
            if in_word {
                tokens.push(std::mem::take(&mut current));
                in_word = false;
            }
            continue;
        }
        current.push(c);
        in_word = true;
    }

    if in_single || in_double {
        return Err(Error::validation_for_field(
            "command",
            format!("unterminated quote in {line:?}"),
        ));
    }
    if escaped {
        return Err(Error::validation_for_field(
            "command",
            format!("trailing backslash in {line:?}"),
        ));
    }
    if in_word {
        tokens.push(current);
    }
    Ok(tokens)
}

/// The value of `--namespace`/`-n` in `args`, if present
///
/// Accepts `--namespace v`, `--namespace=v`, `-n v`, `-nv` and `-n=v`. Stops
/// at `--`. The last occurrence wins. A flag with no value is an error.
pub fn namespace_flag(args: &[String]) -> Result<Option<String>, Error> {
    let mut found = None;
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        let inline = if let Some(rest) = arg.strip_prefix("--namespace") {
            match rest.strip_prefix('=') {
                Some(value) => Some(value),
                None if rest.is_empty() => None,
                None => continue,
            }
        } else if let Some(rest) = arg.strip_prefix("-n") {
            if rest.is_empty() {
                None
            } else {
                Some(rest.strip_prefix('=').unwrap_or(rest))
            }
        } else {
            continue;
        };

        let value = match inline {
            Some(value) => value.to_string(),
            None => iter.next().cloned().ok_or_else(|| {
                Error::validation_for_field("command", format!("flag needs an argument: {arg}"))
            })?,
        };
        found = Some(value);
    }

    Ok(found)
}
