//! Child command lines and wide-string conversion
//!
//! Windows hands a child one command line, not an argument vector. Two
//! builders are provided: `MsvcQuoting`, whose output `CommandLineToArgvW`
//! splits back into the original arguments, and `ShellCommand`, which wraps
//! the `shell flag command` form the way the configured shell expects.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("{0} contains a NUL character")]
    InteriorNul(&'static str),

    #[error("{0} is not valid UTF-16")]
    InvalidUtf16(&'static str),

    #[error("Invalid environment variable name {0:?}")]
    InvalidEnvKey(String),

    #[error("Empty argument vector")]
    EmptyArgv,
}

/// NUL-terminated UTF-16 copy of `s`
pub fn to_wide(what: &'static str, s: &str) -> Result<Vec<u16>, ConversionError> {
    if s.contains('\0') {
        return Err(ConversionError::InteriorNul(what));
    }
    Ok(s.encode_utf16().chain(std::iter::once(0)).collect())
}

/// Narrow copy of a UTF-16 string, stopping at the first NUL
pub fn from_wide(what: &'static str, wide: &[u16]) -> Result<String, ConversionError> {
    let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16(&wide[..end]).map_err(|_| ConversionError::InvalidUtf16(what))
}

/// Environment block: `KEY=VALUE` entries, each NUL-terminated, plus a
/// final NUL
pub fn environment_block(vars: &[(String, String)]) -> Result<Vec<u16>, ConversionError> {
    let mut block = Vec::new();
    for (key, value) in vars {
        if key.is_empty() || key.chars().skip(1).any(|c| c == '=') {
            return Err(ConversionError::InvalidEnvKey(key.clone()));
        }
        block.extend(to_wide("environment entry", &format!("{}={}", key, value))?);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

/// Builds the child's command line from its argument vector
pub trait CommandLine: Send + Sync {
    fn build(&self, argv: &[String]) -> Result<String, ConversionError>;

    /// NUL-terminated UTF-16 command line
    fn build_wide(&self, argv: &[String]) -> Result<Vec<u16>, ConversionError> {
        to_wide("command line", &self.build(argv)?)
    }
}

/// Quoting understood by the Microsoft C runtime and `CommandLineToArgvW`
#[derive(Debug, Clone, Copy, Default)]
pub struct MsvcQuoting;

impl MsvcQuoting {
    pub fn quote_arg(arg: &str, out: &mut String) {
        let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\x0b', '"']);
        if !needs_quotes {
            out.push_str(arg);
            return;
        }

        out.push('"');
        let mut backslashes = 0;
        for c in arg.chars() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    // Escape the run of backslashes and the quote itself
                    out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                    out.push('"');
                    backslashes = 0;
                }
                _ => {
                    out.extend(std::iter::repeat('\\').take(backslashes));
                    out.push(c);
                    backslashes = 0;
                }
            }
        }
        // Backslashes before the closing quote must be doubled
        out.extend(std::iter::repeat('\\').take(backslashes * 2));
        out.push('"');
    }
}

impl CommandLine for MsvcQuoting {
    fn build(&self, argv: &[String]) -> Result<String, ConversionError> {
        if argv.is_empty() {
            return Err(ConversionError::EmptyArgv);
        }
        let mut line = String::new();
        for (i, arg) in argv.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            MsvcQuoting::quote_arg(arg, &mut line);
        }
        Ok(line)
    }
}

/// Builder for `shell flag command` invocations.
///
/// When the argument vector is exactly `[shell, flag, command]` the command
/// is wrapped in `xquote` unless it already is; with `xquote = "("` the
/// characters in `xescape` are `^`-escaped first. Any other vector gets
/// simple space quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub shell: String,
    pub flag: String,
    pub xquote: String,
    pub xescape: String,
}

impl ShellCommand {
    /// `cmd.exe /s /c "..."`
    pub fn cmd() -> Self {
        Self {
            shell: "cmd.exe".to_string(),
            flag: "/s /c".to_string(),
            xquote: "\"".to_string(),
            xescape: String::new(),
        }
    }

    fn is_quoted(&self, command: &str) -> bool {
        match self.xquote.as_str() {
            "" => true,
            "(" => command.starts_with('(') && command.ends_with(')'),
            "\"(" => command.len() >= 4 && command.starts_with("\"(") && command.ends_with(")\""),
            xq => command.len() >= 2 * xq.len() && command.starts_with(xq) && command.ends_with(xq),
        }
    }

    fn quote_command(&self, command: &str) -> String {
        if self.is_quoted(command) {
            return command.to_string();
        }
        match self.xquote.as_str() {
            "(" => {
                let mut escaped = String::with_capacity(command.len());
                for c in command.chars() {
                    if self.xescape.contains(c) {
                        escaped.push('^');
                    }
                    escaped.push(c);
                }
                format!("({})", escaped)
            }
            "\"(" => format!("\"({})\"", command),
            xq => format!("{}{}{}", xq, command, xq),
        }
    }
}

fn quote_if_spaced(arg: &str, out: &mut String) {
    if arg.contains(' ') {
        out.push('"');
        out.push_str(&arg.replace('"', "\\\""));
        out.push('"');
    } else {
        out.push_str(arg);
    }
}

impl CommandLine for ShellCommand {
    fn build(&self, argv: &[String]) -> Result<String, ConversionError> {
        let (program, args) = argv.split_first().ok_or(ConversionError::EmptyArgv)?;

        let mut line = String::new();
        if program.contains(' ') {
            line.push('"');
            line.push_str(program);
            line.push('"');
        } else {
            line.push_str(program);
        }

        if let [flag, command] = args {
            if *program == self.shell && *flag == self.flag {
                line.push(' ');
                line.push_str(flag);
                line.push(' ');
                line.push_str(&self.quote_command(command));
                return Ok(line);
            }
        }

        for arg in args {
            line.push(' ');
            quote_if_spaced(arg, &mut line);
        }
        Ok(line)
    }
}
