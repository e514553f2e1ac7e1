use crate::db::Store;
use crate::error::Result;
use crate::models::{ImageWithTags, PromptSearch, TagCount};
use crate::util::clean_tag_name;
use std::collections::{BTreeSet, HashSet};

pub const DEFAULT_TOP_TAGS: usize = 10;

/// Maps a free-form question onto known tags. The reply is expected to be a
/// JSON array of tag names, as a chat model would return it.
pub trait PromptMatcher: Send + Sync {
    fn match_tags(&self, prompt: &str, all_tags: &[String]) -> Result<String>;
}

/// Offline matcher: picks every known tag that occurs as a whole word or
/// phrase in the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordMatcher;

impl PromptMatcher for KeywordMatcher {
    fn match_tags(&self, prompt: &str, all_tags: &[String]) -> Result<String> {
        let haystack = format!(" {} ", clean_tag_name(prompt));
        let selected: Vec<&String> = all_tags
            .iter()
            .filter(|tag| !tag.is_empty() && haystack.contains(&format!(" {tag} ")))
            .collect();
        Ok(serde_json::to_string(&selected)?)
    }
}

/// Decodes a matcher reply. Anything but a JSON array yields no tags;
/// non-string entries are ignored and the rest normalized.
pub fn parse_tag_reply(reply: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(reply.trim()) {
        Ok(serde_json::Value::Array(items)) => {
            let mut seen = HashSet::new();
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(clean_tag_name)
                .filter(|tag| !tag.is_empty() && seen.insert(tag.clone()))
                .collect()
        }
        Ok(other) => {
            log::warn!("Tag reply is not a list: {other}");
            Vec::new()
        }
        Err(err) => {
            log::warn!("Tag reply parsing failed: {err} -- raw: {reply}");
            Vec::new()
        }
    }
}

/// Images carrying a tag that contains `query`; a blank query lists all.
pub fn search_by_tag(store: &Store, query: &str) -> Result<Vec<ImageWithTags>> {
    let query = query.trim();
    store.list_images(if query.is_empty() { None } else { Some(query) })
}

pub fn top_tags(store: &Store, limit: usize, blocked: &BTreeSet<String>) -> Result<Vec<TagCount>> {
    store.top_tags(limit, blocked)
}

pub fn search_by_prompt(
    store: &Store,
    matcher: &dyn PromptMatcher,
    prompt: &str,
) -> Result<PromptSearch> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Ok(PromptSearch::default());
    }

    let all_tags: Vec<String> = store
        .all_tag_names()?
        .iter()
        .map(|name| clean_tag_name(name))
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let reply = matcher.match_tags(prompt, &all_tags)?;
    let matched_tags = parse_tag_reply(&reply);
    log::info!("Prompt '{prompt}' matched tags {matched_tags:?}");

    let wanted: HashSet<&str> = matched_tags.iter().map(String::as_str).collect();
    let images = store
        .list_images(None)?
        .into_iter()
        .filter(|image| {
            image
                .tags
                .iter()
                .any(|tag| wanted.contains(clean_tag_name(tag).as_str()))
        })
        .collect();

    Ok(PromptSearch {
        query: prompt.to_string(),
        matched_tags,
        images,
    })
}
