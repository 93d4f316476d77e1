use std::fmt;
use std::process::Command;

use crate::error::{Error, Result};

/// An API access token. The token value is redacted from `Debug` output so
/// it never ends up in logs.
#[derive(Clone)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve a token from a configuration entry: a literal `token` value
    /// takes precedence; otherwise `token_from_process` is run through the
    /// shell and its trimmed standard output is used.
    pub fn from_config(
        token: Option<&str>,
        token_from_process: Option<&str>,
    ) -> Result<Option<Token>> {
        if let Some(token) = token {
            if !token.is_empty() {
                return Ok(Some(Token(token.to_owned())));
            }
        }

        if let Some(command) = token_from_process {
            if !command.is_empty() {
                let output = Command::new("sh").arg("-c").arg(command).output()?;
                if !output.status.success() {
                    return Err(Error::Config(format!(
                        "token_from_process command {command:?} exited with {}",
                        output.status
                    )));
                }
                let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                if token.is_empty() {
                    return Err(Error::Config(format!(
                        "token_from_process command {command:?} produced no output"
                    )));
                }
                return Ok(Some(Token(token)));
            }
        }

        Ok(None)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token(s.to_owned())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_token_takes_precedence() {
        let token = Token::from_config(Some("abc"), Some("echo nope"))
            .unwrap()
            .unwrap();
        assert_eq!(token.as_str(), "abc");
    }

    #[test]
    fn test_token_from_process() {
        let token = Token::from_config(None, Some("echo s3cret"))
            .unwrap()
            .unwrap();
        assert_eq!(token.as_str(), "s3cret");
    }

    #[test]
    fn test_no_token() {
        assert!(Token::from_config(None, None).unwrap().is_none());
        assert!(Token::from_config(Some(""), None).unwrap().is_none());
    }

    #[test]
    fn test_failing_process_is_a_config_error() {
        assert!(Token::from_config(None, Some("false")).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = Token::from("s3cret");
        assert_eq!(format!("{token:?}"), "Token(***)");
    }
}
