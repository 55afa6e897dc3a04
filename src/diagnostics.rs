use serde::{Deserialize, Serialize};

use crate::sanitize::{Sanitize, Sanitizer};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaretPosition {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiagnosticLocation {
    pub caret: CaretPosition,
}

/// One entry of `gcc -fdiagnostics-format=json` output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompileDiagnostic {
    /// `error`, `warning` or `note`.
    pub kind: String,
    pub message: String,
    /// The warning option that enabled the diagnostic, e.g. `-Wunused-variable`.
    #[serde(default)]
    pub option: Option<String>,
    #[serde(default)]
    pub locations: Vec<DiagnosticLocation>,
    #[serde(default)]
    pub children: Vec<CompileDiagnostic>,
}

/// Extracts the diagnostics from compiler stderr.
///
/// Anything before the JSON array is skipped. Output that cannot be parsed
/// results in an empty list.
pub fn parse(stderr: &str) -> Vec<CompileDiagnostic> {
    let Some(start) = stderr.find('[') else {
        return vec![];
    };
    let mut stream = serde_json::Deserializer::from_str(&stderr[start..])
        .into_iter::<Vec<CompileDiagnostic>>();
    match stream.next() {
        Some(Ok(diagnostics)) => diagnostics,
        Some(Err(e)) => {
            log::debug!("Could not parse compiler diagnostics: {e}");
            vec![]
        }
        None => vec![],
    }
}

impl Sanitize for CompileDiagnostic {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        self.message.sanitize(sanitizer);
        for loc in self.locations.iter_mut() {
            loc.caret.file.sanitize(sanitizer);
        }
        self.children.sanitize(sanitizer);
    }
}
