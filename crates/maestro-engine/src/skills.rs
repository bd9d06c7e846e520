use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{info, warn};

use maestro_agent::toolconfig::PluginLaunch;
use maestro_core::config::PROMPT_CACHE_CAP;

use crate::error::{EngineError, Result};

/// Per-skill document cap (characters).
const MAX_SKILL_CHARS: usize = 20_000;

/// Directive block that opens every system prompt.
const BASE_DIRECTIVES: &str = "You are an autonomous coding assistant working on behalf of a \
remote user. Work directly in the provided repository. Prefer small, reviewable changes and \
explain decisions as you go.";

/// Fixed tool-use and status-line directives appended after the skills.
const TOOL_DIRECTIVES: &str = "## Working with the user\n\
When you need a decision only the user can make, call the ask_user tool and wait for the \
answer. Report notable milestones through notify_user instead of pausing. Keep status lines \
short: one sentence on what you are doing now.";

/// One named skill document on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LibraryFile {
    #[serde(default)]
    skills: Vec<SkillEntry>,
    #[serde(default)]
    plugins: BTreeMap<String, PluginLaunch>,
    #[serde(default)]
    allowed_tools: Vec<String>,
}

struct CacheEntry {
    prompt: String,
    /// (path, mtime) of every document baked into the prompt.
    sources: Vec<(PathBuf, SystemTime)>,
}

/// Insertion-ordered prompt cache, capped at [`PROMPT_CACHE_CAP`] entries.
#[derive(Default)]
struct PromptCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

/// The on-disk configuration: named skill documents and tool-plugin launch
/// specs, loaded once at startup from a single JSON file.
pub struct SkillLibrary {
    skills: HashMap<String, SkillEntry>,
    plugins: BTreeMap<String, PluginLaunch>,
    allowed_tools: Vec<String>,
    cache: Mutex<PromptCache>,
}

impl SkillLibrary {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    EngineError::Library(format!("cannot read library file '{path}': {e}"))
                })?;
                let parsed: LibraryFile = serde_json::from_str(&raw).map_err(|e| {
                    EngineError::Library(format!("bad library file '{path}': {e}"))
                })?;
                info!(
                    skills = parsed.skills.len(),
                    plugins = parsed.plugins.len(),
                    "skill library loaded"
                );
                parsed
            }
            None => LibraryFile::default(),
        };

        Ok(Self {
            skills: file
                .skills
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            plugins: file.plugins,
            allowed_tools: file.allowed_tools,
            cache: Mutex::new(PromptCache::default()),
        })
    }

    pub fn empty() -> Self {
        Self {
            skills: HashMap::new(),
            plugins: BTreeMap::new(),
            allowed_tools: Vec::new(),
            cache: Mutex::new(PromptCache::default()),
        }
    }

    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed_tools
    }

    /// Launch specs for the named plugins. Unknown names are skipped with a
    /// warning so one bad client request cannot fail the whole turn.
    pub fn plugin_launches(&self, names: &[String]) -> BTreeMap<String, PluginLaunch> {
        let mut out = BTreeMap::new();
        for name in names {
            match self.plugins.get(name) {
                Some(launch) => {
                    out.insert(name.clone(), launch.clone());
                }
                None => warn!(plugin = %name, "unknown plugin requested"),
            }
        }
        out
    }

    pub fn builtin_plugins(&self) -> BTreeMap<String, PluginLaunch> {
        let mut out = BTreeMap::new();
        for name in ["ask_user", "notify_user"] {
            if let Some(launch) = self.plugins.get(name) {
                out.insert(name.to_string(), launch.clone());
            }
        }
        out
    }

    /// Skill ids whose id or name appears as a word in `text`.
    pub fn auto_select(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut ids: Vec<String> = self
            .skills
            .values()
            .filter(|s| {
                let id_hit = contains_word(&lowered, &s.id.to_lowercase());
                let name_hit = s
                    .name
                    .as_deref()
                    .is_some_and(|n| contains_word(&lowered, &n.to_lowercase()));
                id_hit || name_hit
            })
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Assemble (or fetch from cache) the system prompt for a skill set.
    ///
    /// Cache key is the sorted id set; entries are invalidated when any
    /// source document's mtime changes, and evicted oldest-inserted-first
    /// once the cache holds [`PROMPT_CACHE_CAP`] prompts.
    pub fn compose_prompt(&self, skill_ids: &[String]) -> String {
        let mut ids: Vec<&str> = skill_ids
            .iter()
            .map(|s| s.as_str())
            .filter(|id| self.skills.contains_key(*id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let key = ids.join("+");

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.entries.get(&key) {
                if sources_fresh(&entry.sources) {
                    return entry.prompt.clone();
                }
            }
        }

        let (prompt, sources) = self.assemble(&ids);

        let mut cache = self.cache.lock().unwrap();
        if !cache.entries.contains_key(&key) {
            if cache.order.len() >= PROMPT_CACHE_CAP {
                if let Some(oldest) = cache.order.pop_front() {
                    cache.entries.remove(&oldest);
                }
            }
            cache.order.push_back(key.clone());
        }
        cache.entries.insert(key, CacheEntry {
            prompt: prompt.clone(),
            sources,
        });
        prompt
    }

    fn assemble(&self, ids: &[&str]) -> (String, Vec<(PathBuf, SystemTime)>) {
        let mut out = String::from(BASE_DIRECTIVES);
        let mut sources = Vec::new();

        for id in ids {
            let Some(skill) = self.skills.get(*id) else {
                continue;
            };
            let path = Path::new(&skill.path);
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let mtime = std::fs::metadata(path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    sources.push((path.to_path_buf(), mtime));

                    let title = skill.name.as_deref().unwrap_or(&skill.id);
                    out.push_str("\n\n---\n\n## Skill: ");
                    out.push_str(title);
                    out.push_str("\n\n");
                    out.push_str(&truncate(&content, MAX_SKILL_CHARS));
                }
                Err(e) => {
                    warn!(skill = %id, path = %skill.path, "skill document unreadable: {e}");
                }
            }
        }

        out.push_str("\n\n");
        out.push_str(TOOL_DIRECTIVES);
        (out, sources)
    }
}

fn sources_fresh(sources: &[(PathBuf, SystemTime)]) -> bool {
    sources.iter().all(|(path, cached)| {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|mtime| mtime == *cached)
            .unwrap_or(false)
    })
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(i, _)| {
        let before_ok = i == 0
            || !haystack[..i]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after = i + needle.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric());
        before_ok && after_ok
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max)
        .last()
        .unwrap_or(0);
    format!("{}\n\n[... truncated ...]", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_with_docs(docs: &[(&str, &str)]) -> (tempfile::TempDir, SkillLibrary) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut skills = HashMap::new();
        for (id, content) in docs {
            let path = dir.path().join(format!("{id}.md"));
            std::fs::write(&path, content).expect("write doc");
            skills.insert(
                id.to_string(),
                SkillEntry {
                    id: id.to_string(),
                    name: None,
                    path: path.to_string_lossy().into_owned(),
                },
            );
        }
        let lib = SkillLibrary {
            skills,
            plugins: BTreeMap::new(),
            allowed_tools: Vec::new(),
            cache: Mutex::new(PromptCache::default()),
        };
        (dir, lib)
    }

    #[test]
    fn prompt_contains_base_skills_and_directives() {
        let (_dir, lib) = library_with_docs(&[("rust", "always run clippy")]);
        let prompt = lib.compose_prompt(&["rust".to_string()]);
        assert!(prompt.starts_with(BASE_DIRECTIVES));
        assert!(prompt.contains("always run clippy"));
        assert!(prompt.contains("ask_user"));
    }

    #[test]
    fn cache_key_ignores_id_order_and_duplicates() {
        let (_dir, lib) = library_with_docs(&[("a", "doc a"), ("b", "doc b")]);
        let p1 = lib.compose_prompt(&["a".into(), "b".into()]);
        let p2 = lib.compose_prompt(&["b".into(), "a".into(), "a".into()]);
        assert_eq!(p1, p2);
        assert_eq!(lib.cache.lock().unwrap().entries.len(), 1);
    }

    #[test]
    fn mtime_change_invalidates_cached_prompt() {
        let (dir, lib) = library_with_docs(&[("rust", "version one")]);
        let p1 = lib.compose_prompt(&["rust".to_string()]);
        assert!(p1.contains("version one"));

        let path = dir.path().join("rust.md");
        std::fs::write(&path, "version two").unwrap();
        // Force a visibly different mtime, some filesystems are coarse.
        let new_time = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let _ = filetime_set(&path, new_time);

        let p2 = lib.compose_prompt(&["rust".to_string()]);
        assert!(p2.contains("version two"), "stale prompt served: {p2}");
    }

    // Minimal mtime setter so the test does not need another dev-dependency.
    fn filetime_set(path: &Path, t: SystemTime) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.set_modified(t)
    }

    #[test]
    fn cache_evicts_in_insertion_order() {
        let docs: Vec<(String, String)> = (0..(PROMPT_CACHE_CAP + 2))
            .map(|i| (format!("s{i}"), format!("doc {i}")))
            .collect();
        let doc_refs: Vec<(&str, &str)> = docs
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        let (_dir, lib) = library_with_docs(&doc_refs);

        for (id, _) in &docs {
            lib.compose_prompt(&[id.clone()]);
        }
        let cache = lib.cache.lock().unwrap();
        assert_eq!(cache.entries.len(), PROMPT_CACHE_CAP);
        assert!(!cache.entries.contains_key("s0"), "oldest entry must go");
        assert!(!cache.entries.contains_key("s1"));
    }

    #[test]
    fn auto_select_matches_whole_words_only() {
        let (_dir, lib) = library_with_docs(&[("rust", "r"), ("go", "g")]);
        assert_eq!(lib.auto_select("please fix the rust build"), vec!["rust"]);
        // "going" must not match the "go" skill.
        assert!(lib.auto_select("keep going with it").is_empty());
    }

    #[test]
    fn unknown_skills_are_ignored() {
        let (_dir, lib) = library_with_docs(&[("rust", "doc")]);
        let prompt = lib.compose_prompt(&["rust".into(), "ghost".into()]);
        assert!(prompt.contains("doc"));
    }
}
