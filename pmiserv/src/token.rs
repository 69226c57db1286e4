//! Token table: a command's arguments as ordered key/value pairs.

use crate::error::PmiError;

/// One `key=value` argument. `value` is `None` for a bare flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub key: String,
    pub value: Option<String>,
}

impl Token {
    /// Split on the first `=`. Malformed tokens (e.g. an empty key) are kept.
    pub fn parse(arg: &str) -> Self {
        match arg.split_once('=') {
            Some((key, value)) => Self {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => Self {
                key: arg.to_string(),
                value: None,
            },
        }
    }
}

/// Arguments of one command in appearance order. Duplicates are kept and the
/// first match wins on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens(Vec<Token>);

impl Tokens {
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(args.into_iter().map(|a| Token::parse(a.as_ref())).collect())
    }

    /// Value of the first token whose key matches exactly.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// Like [`find`](Self::find), but a missing key is an error naming `cmd`.
    pub fn require(&self, cmd: &str, key: &'static str) -> Result<&str, PmiError> {
        self.find(key).ok_or_else(|| PmiError::MissingKey {
            cmd: cmd.to_string(),
            key,
        })
    }

    /// Parse the value of `key`, if present.
    pub fn find_parsed<T: std::str::FromStr>(
        &self,
        key: &'static str,
    ) -> Result<Option<T>, PmiError> {
        self.find(key)
            .map(|v| {
                v.parse().map_err(|_| PmiError::InvalidValue {
                    key,
                    value: v.to_string(),
                })
            })
            .transpose()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Tokens {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
