use crate::error::Error;

/// What a token is replaced with.
pub const PLACEHOLDER: &str = "studentcode";

/// Scrubs one execution's token from text destined for the caller.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    token: String,
}

impl Sanitizer {
    /// Fails for tokens made up only of characters that a replacement can
    /// produce. Such a token could be rebuilt by every pass of `sanitize`.
    pub fn new<S: Into<String>>(token: S) -> Result<Self, Error> {
        let token = token.into();
        if !token
            .chars()
            .any(|c| c != '-' && !PLACEHOLDER.contains(c))
        {
            return Err(Error::from(format!(
                "Token \"{token}\" cannot be told apart from the placeholder \"{PLACEHOLDER}\""
            )));
        }
        Ok(Sanitizer { token: token })
    }

    /// Replaces every occurrence of the token with `PLACEHOLDER`.
    ///
    /// A token directly followed by a letter becomes `studentcode-<letter>`
    /// so that the placeholder does not merge with the following word; any
    /// other occurrence is replaced as is. Passes repeat until the token is
    /// gone, so sanitizing the result again changes nothing. Every new
    /// occurrence uses up a character of the input, so this terminates.
    pub fn sanitize<S: AsRef<str>>(&self, text: S) -> String {
        let text = text.as_ref();
        if !text.contains(&self.token) {
            return text.to_string();
        }
        let mut current = self.replace_once(text);
        while current.contains(&self.token) {
            current = self.replace_once(&current);
        }
        current
    }

    fn replace_once(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(idx) = rest.find(&self.token) {
            out.push_str(&rest[..idx]);
            out.push_str(PLACEHOLDER);
            rest = &rest[idx + self.token.len()..];
            if rest.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
                out.push('-');
            }
        }
        out.push_str(rest);
        out
    }
}

/// Types carrying text that must be sanitized before it is returned.
pub trait Sanitize {
    fn sanitize(&mut self, sanitizer: &Sanitizer);
}

impl Sanitize for String {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        *self = sanitizer.sanitize(self.as_str());
    }
}

impl<T: Sanitize> Sanitize for Option<T> {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        if let Some(v) = self.as_mut() {
            v.sanitize(sanitizer);
        }
    }
}

/// Error messages may carry workspace paths.
impl Sanitize for Error {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        match self {
            Error::SetupError(s) | Error::RawError(s) => s.sanitize(sanitizer),
            Error::SyscommandTimeoutError { stdout, stderr }
            | Error::SyscommandOutputLimitExceededError { stdout, stderr, .. } => {
                stdout.sanitize(sanitizer);
                stderr.sanitize(sanitizer);
            }
            _ => {}
        }
    }
}

impl<T: Sanitize> Sanitize for Vec<T> {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        for v in self.iter_mut() {
            v.sanitize(sanitizer);
        }
    }
}
