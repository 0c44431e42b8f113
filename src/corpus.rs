//! Entity corpus loader.
//!
//! Walks the entity type directories under `<repo>/contexts/`, parses each
//! YAML file, and derives one to three [`Document`]s per entity:
//!
//! | Field | Emitted when | Text |
//! |-------|--------------|------|
//! | `primary` | entity has a non-empty `id` | `ID/Title/Type/Status` block |
//! | `description` | `objective` or `description` is longer than 10 chars | the text verbatim |
//! | `userstory` | type is `userstory` and `asA`, `iWant`, `soThat` are all set | `As a ..., I want ... so that ...` |
//!
//! A file that fails to read or parse is logged and skipped; it never
//! aborts the load.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_yaml::Value;
use std::path::{Component, Path};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ContextKitError, Result};
use crate::models::{DocField, Document, DocumentMetadata, Entity, EntityType};

/// Directory segments that hold third-party files.
const VENDORED_SEGMENTS: &[&str] = &["node_modules"];

/// Minimum length (in characters) for an objective/description to be indexed.
const MIN_DESCRIPTION_CHARS: usize = 10;

/// Load every entity in the repository and derive its documents.
pub fn load_corpus(repo_path: &Path) -> Result<Vec<Document>> {
    let entities = load_entities(repo_path)?;
    let documents: Vec<Document> = entities
        .iter()
        .flat_map(entity_documents)
        .filter(|doc| {
            let path = Path::new(&doc.metadata.path);
            !is_vendored_path(path.strip_prefix(repo_path).unwrap_or(path))
        })
        .collect();

    debug!(
        entities = entities.len(),
        documents = documents.len(),
        "loaded corpus"
    );
    Ok(documents)
}

/// Load all entities, across every type directory.
pub fn load_entities(repo_path: &Path) -> Result<Vec<Entity>> {
    let exclude_set = build_globset(&["**/node_modules/**", "**/.git/**"])?;
    let include_set = build_globset(&["**/*.yaml", "**/*.yml"])?;
    let contexts_dir = repo_path.join("contexts");

    let mut entities = Vec::new();

    for entity_type in EntityType::ALL {
        let type_dir = contexts_dir.join(entity_type.dir_name());
        if !type_dir.is_dir() {
            continue;
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&type_dir).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %type_dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(repo_path).unwrap_or(entry.path());
            let rel_str = relative.to_string_lossy();
            if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
                continue;
            }
            files.push(entry.into_path());
        }

        // Deterministic order keeps the index checksum stable across runs.
        files.sort();

        for path in files {
            match parse_entity_file(&path, entity_type) {
                Ok(Some(entity)) => entities.push(entity),
                Ok(None) => {}
                Err(e) => warn!(file = %path.display(), error = %e, "skipping entity file"),
            }
        }
    }

    Ok(entities)
}

fn parse_entity_file(path: &Path, entity_type: EntityType) -> anyhow::Result<Option<Entity>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_yaml::from_str(&content)?;
    Ok(entity_from_value(&value, entity_type, path))
}

/// Build an [`Entity`] from parsed YAML. Returns `None` for non-mapping documents.
pub fn entity_from_value(value: &Value, entity_type: EntityType, path: &Path) -> Option<Entity> {
    let map = value.as_mapping()?;
    let field = |key: &str| -> Option<String> {
        map.get(key)
            .and_then(scalar_to_string)
            .filter(|s| !s.trim().is_empty())
    };

    Some(Entity {
        id: field("id").unwrap_or_default(),
        title: field("title"),
        status: field("status"),
        objective: field("objective"),
        description: field("description"),
        as_a: field("asA"),
        i_want: field("iWant"),
        so_that: field("soThat"),
        entity_type: Some(entity_type),
        file: path.to_path_buf(),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Derive the documents for a single entity. Entities without an id yield none.
pub fn entity_documents(entity: &Entity) -> Vec<Document> {
    let id = entity.id.trim();
    if id.is_empty() {
        return Vec::new();
    }

    let type_name = entity
        .entity_type
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let path = entity.file.to_string_lossy().to_string();
    let meta = |field: DocField| DocumentMetadata {
        id: id.to_string(),
        entity_type: type_name.clone(),
        path: path.clone(),
        field,
        title: entity.title.clone(),
    };

    let mut docs = vec![Document {
        page_content: format!(
            "ID: {}\nTitle: {}\nType: {}\nStatus: {}",
            id,
            entity.title.as_deref().unwrap_or("Untitled"),
            type_name,
            entity.status.as_deref().unwrap_or("unknown"),
        ),
        metadata: meta(DocField::Primary),
    }];

    if let Some(text) = entity.objective.as_ref().or(entity.description.as_ref()) {
        if text.chars().count() > MIN_DESCRIPTION_CHARS {
            docs.push(Document {
                page_content: text.clone(),
                metadata: meta(DocField::Description),
            });
        }
    }

    if entity.entity_type == Some(EntityType::UserStory) {
        if let (Some(as_a), Some(i_want), Some(so_that)) =
            (&entity.as_a, &entity.i_want, &entity.so_that)
        {
            docs.push(Document {
                page_content: format!("As a {}, I want {} so that {}", as_a, i_want, so_that),
                metadata: meta(DocField::UserStory),
            });
        }
    }

    docs
}

/// True when any path segment names a vendored-dependency directory.
///
/// Callers pass repository-relative paths, so a repository that itself
/// lives under `node_modules` is not excluded.
pub fn is_vendored_path(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(seg) => VENDORED_SEGMENTS.iter().any(|v| seg == *v),
        _ => false,
    })
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ContextKitError::Configuration(format!("bad glob {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ContextKitError::Configuration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn story(as_a: Option<&str>, i_want: Option<&str>, so_that: Option<&str>) -> Entity {
        Entity {
            id: "US-001".to_string(),
            title: Some("Sign in".to_string()),
            status: Some("draft".to_string()),
            description: Some("Users sign in with their SSO account.".to_string()),
            as_a: as_a.map(str::to_string),
            i_want: i_want.map(str::to_string),
            so_that: so_that.map(str::to_string),
            entity_type: Some(EntityType::UserStory),
            file: PathBuf::from("contexts/userstories/US-001.yaml"),
            ..Entity::default()
        }
    }

    #[test]
    fn test_primary_document_format() {
        let entity = Entity {
            id: "FEAT-001".to_string(),
            entity_type: Some(EntityType::Feature),
            file: PathBuf::from("f.yaml"),
            ..Entity::default()
        };
        let docs = entity_documents(&entity);
        assert_eq!(docs.len(), 1);
        assert_eq!(
            docs[0].page_content,
            "ID: FEAT-001\nTitle: Untitled\nType: feature\nStatus: unknown"
        );
        assert_eq!(docs[0].metadata.field, DocField::Primary);
    }

    #[test]
    fn test_complete_user_story_yields_three_documents() {
        let docs = entity_documents(&story(
            Some("developer"),
            Some("to sign in"),
            Some("I can deploy"),
        ));
        assert_eq!(docs.len(), 3);
        assert_eq!(
            docs[2].page_content,
            "As a developer, I want to sign in so that I can deploy"
        );
        assert_eq!(docs[2].metadata.field, DocField::UserStory);
    }

    #[test]
    fn test_user_story_missing_so_that_has_no_narrative() {
        let docs = entity_documents(&story(Some("developer"), Some("to sign in"), None));
        let fields: Vec<DocField> = docs.iter().map(|d| d.metadata.field).collect();
        assert_eq!(fields, vec![DocField::Primary, DocField::Description]);
    }

    #[test]
    fn test_short_description_skipped() {
        let entity = Entity {
            id: "T-1".to_string(),
            description: Some("too short".to_string()),
            entity_type: Some(EntityType::Task),
            ..Entity::default()
        };
        assert_eq!(entity_documents(&entity).len(), 1);
    }

    #[test]
    fn test_objective_preferred_over_description() {
        let entity = Entity {
            id: "FEAT-2".to_string(),
            objective: Some("Objective text that is long enough".to_string()),
            description: Some("Description text that is long enough".to_string()),
            entity_type: Some(EntityType::Feature),
            ..Entity::default()
        };
        let docs = entity_documents(&entity);
        assert_eq!(docs[1].page_content, "Objective text that is long enough");
    }

    #[test]
    fn test_empty_id_yields_nothing() {
        let entity = Entity {
            id: "  ".to_string(),
            ..Entity::default()
        };
        assert!(entity_documents(&entity).is_empty());
    }

    #[test]
    fn test_vendored_path_detection() {
        assert!(is_vendored_path(Path::new(
            "/repo/contexts/features/node_modules/pkg/x.yaml"
        )));
        assert!(!is_vendored_path(Path::new(
            "/repo/contexts/features/node_modules_notes.yaml"
        )));
    }

    #[test]
    fn test_load_corpus_skips_bad_yaml_and_vendored_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let features = root.join("contexts/features");
        fs::create_dir_all(features.join("node_modules/dep")).unwrap();
        fs::write(
            features.join("FEAT-001.yaml"),
            "id: FEAT-001\ntitle: Login\nstatus: active\nobjective: Let users sign in securely.\n",
        )
        .unwrap();
        fs::write(features.join("broken.yaml"), "id: [unterminated\n").unwrap();
        fs::write(
            features.join("node_modules/dep/FEAT-999.yaml"),
            "id: FEAT-999\ntitle: Vendored\n",
        )
        .unwrap();
        let stories = root.join("contexts/userstories");
        fs::create_dir_all(&stories).unwrap();
        fs::write(
            stories.join("US-001.yml"),
            "id: US-001\ntitle: Sign in\nasA: user\niWant: to log in\nsoThat: I see my data\n",
        )
        .unwrap();

        let docs = load_corpus(root).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.metadata.id.as_str()).collect();
        assert_eq!(ids, vec!["FEAT-001", "FEAT-001", "US-001", "US-001"]);
        assert!(docs.iter().all(|d| d.metadata.id != "FEAT-999"));
        assert_eq!(docs[2].metadata.entity_type, "userstory");
    }

    #[test]
    fn test_missing_contexts_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_corpus(tmp.path()).unwrap().is_empty());
    }
}
