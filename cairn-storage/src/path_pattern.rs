//! Path pattern translation.
//!
//! Maps physical record locations to `(event type, identifier, format)` and
//! back. A template is a `/`-separated list of segments; a segment is either
//! literal text or a whole-segment placeholder:
//!
//! | Placeholder  | Matches                                     |
//! |--------------|---------------------------------------------|
//! | `{type}`     | one segment: the event type                 |
//! | `{path}`     | one segment of the identifier path          |
//! | `{path:**}`  | zero or more segments of the identifier path |
//! | `{id}`       | the leaf id plus an optional `.ext` suffix  |
//!
//! `{type}`, `{path}` (in either form) and `{id}` must all appear.

use cairn_core::{EventType, Format, Identifier, PatternError, StoreConfig};
use regex::Regex;
use tracing::debug;

const GROUPS: [&str; 3] = ["type", "path", "id"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// One physical segment.
    Single(String),
    /// Zero or more physical segments.
    Multi(String),
}

/// A physical location resolved by a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub event_type: EventType,
    pub identifier: Identifier,
    pub format: Format,
    /// Extension as written, `None` for a location without one.
    pub extension: Option<String>,
}

/// One compiled template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    segments: Vec<Segment>,
    regex: Regex,
}

impl PathPattern {
    /// Compile a template.
    ///
    /// # Errors
    ///
    /// - [`PatternError::MissingGroup`] if `{type}`, `{path}` or `{id}` is absent
    /// - [`PatternError::InvalidTemplate`] for unknown, repeated or partial-segment
    ///   placeholders
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let invalid = |reason: String| PatternError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for raw in template.split('/') {
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(inner) => {
                    let (name, multi) = match inner.split_once(':') {
                        Some((name, "**")) => (name, true),
                        Some((_, modifier)) => {
                            return Err(invalid(format!("unsupported modifier '{}'", modifier)))
                        }
                        None => (inner, false),
                    };
                    if !GROUPS.contains(&name) {
                        return Err(invalid(format!("unknown placeholder '{{{}}}'", name)));
                    }
                    if multi && name != "path" {
                        return Err(invalid(format!("'{{{}}}' cannot span segments", name)));
                    }
                    if seen.iter().any(|s| s == name) {
                        return Err(invalid(format!("placeholder '{{{}}}' repeats", name)));
                    }
                    seen.push(name.to_string());
                    if multi {
                        Segment::Multi(name.to_string())
                    } else {
                        Segment::Single(name.to_string())
                    }
                }
                None if raw.contains('{') || raw.contains('}') => {
                    return Err(invalid(format!(
                        "placeholder must span a whole segment: '{}'",
                        raw
                    )))
                }
                None => Segment::Literal(raw.to_string()),
            };
            segments.push(segment);
        }

        if let Some(missing) = GROUPS.iter().find(|g| !seen.iter().any(|s| s == *g)) {
            return Err(PatternError::MissingGroup {
                template: template.to_string(),
                group: missing.to_string(),
            });
        }

        let regex = Regex::new(&build_regex(&segments)).map_err(|e| invalid(e.to_string()))?;
        debug!(template, regex = regex.as_str(), "Compiled path pattern");
        Ok(Self {
            template: template.to_string(),
            segments,
            regex,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Resolve a physical location, or `None` if it does not match.
    ///
    /// A location without an extension gets [`Format::LEGACY`]. An unknown
    /// extension is kept as part of the id.
    pub fn parse(&self, location: &str) -> Option<ParsedPath> {
        let caps = self.regex.captures(location)?;
        let event_type = EventType::new(caps.name("type")?.as_str());
        let path: Vec<String> = caps
            .name("path")
            .map(|m| m.as_str().split('/').map(str::to_string).collect())
            .unwrap_or_default();
        let id = caps.name("id")?.as_str();

        let (id, format, extension) = match caps.name("format") {
            Some(ext) => match Format::from_extension(ext.as_str()) {
                Some(format) => (id.to_string(), format, Some(ext.as_str().to_string())),
                None => (format!("{}.{}", id, ext.as_str()), Format::LEGACY, None),
            },
            None => (id.to_string(), Format::LEGACY, None),
        };
        if id.is_empty() {
            return None;
        }

        Some(ParsedPath {
            event_type,
            identifier: Identifier { path, id },
            format,
            extension,
        })
    }

    /// Render a parsed location back exactly as it was written.
    pub fn to_location(&self, parsed: &ParsedPath) -> String {
        self.to_path_with_extension(
            &parsed.event_type,
            &parsed.identifier,
            parsed.extension.as_deref(),
        )
    }

    /// Render the physical location of a record.
    pub fn to_path(&self, event_type: &EventType, identifier: &Identifier, format: Format) -> String {
        self.to_path_with_extension(event_type, identifier, Some(format.extension()))
    }

    /// Render a location with an explicit extension, or none at all.
    pub fn to_path_with_extension(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        extension: Option<&str>,
    ) -> String {
        let mut rendered: Vec<String> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push(text.clone()),
                Segment::Single(name) | Segment::Multi(name) => match name.as_str() {
                    "type" => rendered.push(event_type.to_string()),
                    "path" if identifier.path.is_empty() && matches!(segment, Segment::Multi(_)) => {}
                    "path" => rendered.push(identifier.path.join("/")),
                    _ => rendered.push(match extension {
                        Some(ext) => format!("{}.{}", identifier.id, ext),
                        None => identifier.id.clone(),
                    }),
                },
            }
        }
        rendered.join("/")
    }
}

/// Anchored regex with named groups `type`, `path`, `id` and `format`.
fn build_regex(segments: &[Segment]) -> String {
    let mut regex = String::from("^");
    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == segments.len();
        match segment {
            Segment::Literal(text) => regex.push_str(&regex::escape(text)),
            Segment::Single(name) if name == "id" => {
                regex.push_str(r"(?P<id>[^/]+?)(?:\.(?P<format>[A-Za-z0-9]+))?")
            }
            Segment::Single(name) => regex.push_str(&format!("(?P<{}>[^/]+)", name)),
            Segment::Multi(name) if last => {
                // The separator before a trailing multi segment is optional.
                if regex.ends_with('/') {
                    regex.pop();
                    regex.push_str(&format!("(?:/(?P<{}>[^/]+(?:/[^/]+)*))?", name));
                } else {
                    regex.push_str(&format!("(?P<{}>[^/]+(?:/[^/]+)*)?", name));
                }
                continue;
            }
            Segment::Multi(name) => {
                regex.push_str(&format!("(?:(?P<{}>[^/]+(?:/[^/]+)*)/)?", name));
                continue;
            }
        }
        if !last {
            regex.push('/');
        }
    }
    regex.push('$');
    regex
}

/// The main pattern plus override patterns.
///
/// Parsing tries overrides in order, then the main pattern. Writes always use
/// the main pattern.
#[derive(Debug, Clone)]
pub struct PathPatterns {
    main: PathPattern,
    overrides: Vec<PathPattern>,
}

impl PathPatterns {
    pub fn new(main: PathPattern, overrides: Vec<PathPattern>) -> Self {
        Self { main, overrides }
    }

    /// Compile the patterns named in the configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self, PatternError> {
        let main = PathPattern::compile(&config.main_pattern)?;
        let overrides = config
            .override_patterns
            .iter()
            .map(|t| PathPattern::compile(t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(main, overrides))
    }

    pub fn main(&self) -> &PathPattern {
        &self.main
    }

    /// Every pattern, in parse order.
    pub fn iter(&self) -> impl Iterator<Item = &PathPattern> {
        self.overrides.iter().chain(std::iter::once(&self.main))
    }

    pub fn parse(&self, location: &str) -> Option<ParsedPath> {
        self.iter().find_map(|p| p.parse(location))
    }

    /// Location a write goes to.
    pub fn to_path(&self, event_type: &EventType, identifier: &Identifier, format: Format) -> String {
        self.main.to_path(event_type, identifier, format)
    }

    /// Every location a record could live at, under any pattern and any
    /// extension. Used to delete a record wherever it was written.
    pub fn all_paths(&self, event_type: &EventType, identifier: &Identifier) -> Vec<String> {
        let extensions = [Some("json"), Some("yml"), Some("yaml"), None];
        let mut paths: Vec<String> = Vec::new();
        for pattern in self.iter() {
            for ext in extensions {
                let path = pattern.to_path_with_extension(event_type, identifier, ext);
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}
