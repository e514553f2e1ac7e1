use crate::error::{Error, Result};
use crate::models::TagSummary;
use crate::util::clean_tag_name;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

/// The vision service: image in, newline-delimited tag text out.
pub trait Tagger: Send + Sync {
    fn tag_image(&self, image_path: &Path) -> Result<TagSummary>;
}

impl TagSummary {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }

    /// Normalized tags in line order, empties and repeats dropped.
    pub fn tags(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.summary
            .lines()
            .map(clean_tag_name)
            .filter(|tag| !tag.is_empty())
            .filter(|tag| seen.insert(tag.clone()))
            .collect()
    }
}

/// Runs an external program with the image path appended and treats its
/// stdout as the summary.
pub struct CommandTagger {
    program: String,
    args: Vec<String>,
}

impl CommandTagger {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::Init("Tagger command is empty".into()))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

impl Tagger for CommandTagger {
    fn tag_image(&self, image_path: &Path) -> Result<TagSummary> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()
            .map_err(|e| Error::Tagging(format!("Failed to execute {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Tagging(format!(
                "{} returned {} for {:?}: {}",
                self.program,
                output.status,
                image_path,
                stderr.trim()
            )));
        }

        Ok(TagSummary::new(String::from_utf8_lossy(&output.stdout)))
    }
}

/// Returns the same summary for every image. With an empty summary this is
/// the tagger used when no vision command is configured.
#[derive(Debug, Clone, Default)]
pub struct FixedTagger {
    summary: String,
}

impl FixedTagger {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

impl Tagger for FixedTagger {
    fn tag_image(&self, _image_path: &Path) -> Result<TagSummary> {
        Ok(TagSummary::new(self.summary.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tags_are_normalized_and_unique() {
        let summary = TagSummary::new("```json\n[\n  \"Cable\",\n  \"power\",\n  \"cable\"\n]\n```");
        assert_eq!(summary.tags(), vec!["json".to_string(), "cable".into(), "power".into()]);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandTagger::new(Vec::new()).is_err());
        assert!(CommandTagger::new(vec!["  ".into()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_tagger_reads_stdout() {
        let tagger = CommandTagger::new(vec!["echo".into(), "lamp".into()]).unwrap();
        let summary = tagger.tag_image(Path::new("desk.jpg")).unwrap();
        assert_eq!(summary.tags(), vec!["lamp deskjpg".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn command_tagger_surfaces_failures() {
        let tagger = CommandTagger::new(vec!["false".into()]).unwrap();
        assert!(matches!(
            tagger.tag_image(Path::new("desk.jpg")),
            Err(Error::Tagging(_))
        ));
        let missing = CommandTagger::new(vec!["definitely-not-a-real-binary-xyz".into()]).unwrap();
        assert!(matches!(
            missing.tag_image(Path::new("desk.jpg")),
            Err(Error::Tagging(_))
        ));
    }
}
