//! Context bundles and the extraction prompt template.
//!
//! Every chunk request renders the same template with three placeholders:
//! the schema name, an optional context bundle, and the chunk text. The
//! template can be overridden per schema directory; the compiled-in
//! default covers the common case. Context bundles concatenate whatever
//! textual fragments the run was pointed at — schema-level background or
//! a per-file companion — and are immutable once built.

use std::path::Path;

use tracing::debug;

use crate::io;

/// Compiled-in extraction prompt. `{schema_name}`, `{context}`, and
/// `{text}` are substituted at render time.
pub const DEFAULT_EXTRACTION_TEMPLATE: &str = "\
You are extracting structured records from a historical text source. \
Extract every record present in the section below into the structured \
output format named \"{schema_name}\". Transcribe values faithfully; do \
not invent, summarize, or merge records. Sections are fragments of a \
larger document, so incomplete leading or trailing records are expected: \
extract what is present.

{context}

----- SECTION -----
{text}
----- END SECTION -----
";

/// Filename of a per-schema template override, under `prompts/` in the
/// schema directory.
const TEMPLATE_OVERRIDE: &str = "extraction_prompt.txt";

/// Where the context bundle's fragments come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextSource {
    /// Schema-level context files under `<schema_dir>/context/`.
    #[default]
    Default,
    /// A `<stem>_context.txt` companion next to the input file.
    File,
}

impl ContextSource {
    /// Parses a source name as given on the command line.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// The extraction prompt template with placeholder substitution.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    /// Loads the template override from the schema directory, falling
    /// back to the compiled-in default.
    #[must_use]
    pub fn load(schema_dir: &Path) -> Self {
        let override_path = schema_dir.join("prompts").join(TEMPLATE_OVERRIDE);
        let template = if override_path.is_file() {
            io::read_file(&override_path).ok().unwrap_or_else(|| {
                DEFAULT_EXTRACTION_TEMPLATE.to_string()
            })
        } else {
            DEFAULT_EXTRACTION_TEMPLATE.to_string()
        };
        Self { template }
    }

    /// Builds a template from an explicit string (tests, embedding).
    #[must_use]
    pub fn from_string(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Renders the prompt for one chunk.
    #[must_use]
    pub fn render(&self, schema_name: &str, context: &str, chunk_text: &str) -> String {
        let context_block = if context.is_empty() {
            String::new()
        } else {
            format!("Background for this source:\n{context}")
        };
        self.template
            .replace("{schema_name}", schema_name)
            .replace("{context}", &context_block)
            .replace("{text}", chunk_text)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::from_string(DEFAULT_EXTRACTION_TEMPLATE)
    }
}

/// Assembles the context bundle for one input file.
///
/// Returns an empty string when context is disabled or no fragment files
/// exist. Fragments are concatenated with blank lines in a fixed order,
/// so the bundle is deterministic per request.
#[must_use]
pub fn assemble_context(
    enabled: bool,
    source: ContextSource,
    schema_dir: &Path,
    input_path: &Path,
) -> String {
    if !enabled {
        return String::new();
    }

    let mut fragments: Vec<String> = Vec::new();
    match source {
        ContextSource::Default => {
            for name in ["basic_context.txt", "additional_context.txt"] {
                let path = schema_dir.join("context").join(name);
                if let Ok(text) = io::read_file(&path) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        fragments.push(trimmed.to_string());
                    }
                } else {
                    debug!(path = %path.display(), "no context fragment");
                }
            }
        }
        ContextSource::File => {
            let stem = input_path
                .file_stem()
                .map_or_else(String::new, |s| s.to_string_lossy().to_string());
            let path = input_path.with_file_name(format!("{stem}_context.txt"));
            if let Ok(text) = io::read_file(&path) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    fragments.push(trimmed.to_string());
                }
            } else {
                debug!(path = %path.display(), "no file-specific context");
            }
        }
    }

    fragments.join("\n\n")
}
