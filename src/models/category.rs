//! Category registry
//!
//! Static mapping from category key to visual title, default logo and the
//! ordered keyword list used to classify channels by display name. The
//! registry is read-only once built and is passed explicitly to every
//! component that needs it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Validated category key (snake_case, only produced by a registry)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry and inventory validation errors
#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("unknown category key: {0}")]
    UnknownKey(String),
    #[error("invalid category key {0:?}: only lowercase letters, digits and '_' are allowed")]
    InvalidKey(String),
    #[error("duplicate category key: {0}")]
    DuplicateKey(String),
    #[error("category {key:?} reuses label {label:?} already taken by {owner:?}")]
    DuplicateLabel {
        key: String,
        label: String,
        owner: String,
    },
    #[error("fallback category {0:?} is not defined in the registry")]
    MissingFallback(String),
    #[error("category registry has no categories")]
    Empty,
    #[error("failed to read category registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse category registry {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One category as written in a registry file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// On-disk registry format (CATEGORY_REGISTRY_PATH)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    pub fallback: String,
    #[serde(default)]
    pub exclusions: Vec<String>,
    pub categories: Vec<CategoryDefinition>,
}

/// A registered category with normalized keywords
#[derive(Debug, Clone)]
pub struct Category {
    pub key: CategoryKey,
    pub title: String,
    pub logo: Option<String>,
    keywords: Vec<String>,
}

/// Read-only category registry
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    categories: Vec<Category>,
    by_key: HashMap<String, usize>,
    by_label: HashMap<String, usize>,
    fallback: usize,
    exclusions: Vec<String>,
}

impl CategoryRegistry {
    /// Build and validate a registry from its file representation
    pub fn from_definitions(file: RegistryFile) -> Result<Self, CategoryError> {
        if file.categories.is_empty() {
            return Err(CategoryError::Empty);
        }

        let mut categories = Vec::with_capacity(file.categories.len());
        let mut by_key = HashMap::new();
        let mut by_label = HashMap::new();

        for (idx, def) in file.categories.into_iter().enumerate() {
            if !is_valid_key(&def.key) {
                return Err(CategoryError::InvalidKey(def.key));
            }
            if by_key.insert(def.key.clone(), idx).is_some() {
                return Err(CategoryError::DuplicateKey(def.key));
            }

            // Titles resolve back to their key (group-title="★ DEPORTES ★" -> deportes).
            // A label owned by another category would file records under the wrong key.
            for label in [def.key.clone(), normalize_label(&def.title)] {
                if label.is_empty() {
                    continue;
                }
                match by_label.get(&label).copied() {
                    Some(owner) if owner != idx => {
                        let owner: &Category = &categories[owner];
                        return Err(CategoryError::DuplicateLabel {
                            key: def.key,
                            label,
                            owner: owner.key.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        by_label.insert(label, idx);
                    }
                }
            }

            let keywords = def
                .keywords
                .iter()
                .map(|k| normalize_name(k))
                .filter(|k| !k.is_empty())
                .collect();

            categories.push(Category {
                key: CategoryKey(def.key),
                title: def.title,
                logo: def.logo.filter(|l| !l.trim().is_empty()),
                keywords,
            });
        }

        let fallback = *by_key
            .get(&file.fallback)
            .ok_or_else(|| CategoryError::MissingFallback(file.fallback.clone()))?;

        let exclusions = file
            .exclusions
            .iter()
            .map(|e| normalize_name(e))
            .filter(|e| !e.is_empty())
            .collect();

        Ok(Self {
            categories,
            by_key,
            by_label,
            fallback,
            exclusions,
        })
    }

    /// Built-in registry used when no CATEGORY_REGISTRY_PATH is configured
    pub fn builtin() -> Result<Self, CategoryError> {
        Self::from_definitions(builtin_definitions())
    }

    /// Load a registry from a JSON file
    pub async fn load(path: &Path) -> Result<Self, CategoryError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CategoryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file: RegistryFile =
            serde_json::from_str(&content).map_err(|source| CategoryError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_definitions(file)
    }

    /// Look up a key, rejecting anything not registered
    pub fn key(&self, key: &str) -> Result<CategoryKey, CategoryError> {
        self.by_key
            .get(key)
            .map(|&idx| self.categories[idx].key.clone())
            .ok_or_else(|| CategoryError::UnknownKey(key.to_string()))
    }

    pub fn contains(&self, key: &CategoryKey) -> bool {
        self.by_key.contains_key(key.as_str())
    }

    pub fn get(&self, key: &CategoryKey) -> Option<&Category> {
        self.by_key.get(key.as_str()).map(|&idx| &self.categories[idx])
    }

    pub fn fallback(&self) -> &CategoryKey {
        &self.categories[self.fallback].key
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    /// Visual section title for a category
    pub fn title_for(&self, key: &CategoryKey) -> String {
        match self.get(key) {
            Some(category) => category.title.clone(),
            None => format!("★ {} ★", key.as_str().replace('_', " ").to_uppercase()),
        }
    }

    pub fn logo_for(&self, key: &CategoryKey) -> Option<&str> {
        self.get(key).and_then(|c| c.logo.as_deref())
    }

    /// Resolve a key, a visual title or a raw group-title back to a key
    pub fn resolve(&self, label: &str) -> Option<CategoryKey> {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(&idx) = self.by_key.get(trimmed) {
            return Some(self.categories[idx].key.clone());
        }
        self.by_label
            .get(&normalize_label(trimmed))
            .map(|&idx| self.categories[idx].key.clone())
    }

    /// First category (in registry order) with a keyword contained in the name.
    /// `normalized_name` must come from [`normalize_name`].
    pub fn match_keywords(&self, normalized_name: &str) -> Option<CategoryKey> {
        self.categories
            .iter()
            .find(|c| c.keywords.iter().any(|k| normalized_name.contains(k.as_str())))
            .map(|c| c.key.clone())
    }

    /// Whether a normalized name contains an exclusion keyword
    pub fn is_excluded(&self, normalized_name: &str) -> bool {
        self.exclusions
            .iter()
            .any(|e| normalized_name.contains(e.as_str()))
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Normalize a group-title or visual title into snake_case label form:
/// lowercase, punctuation and symbols removed, whitespace runs joined by '_'
pub fn normalize_label(raw: &str) -> String {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Normalize a display name for keyword matching:
/// lowercase, accents folded, dots removed
pub fn normalize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| *c != '.')
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

fn def(key: &str, title: &str, keywords: &[&str]) -> CategoryDefinition {
    CategoryDefinition {
        key: key.to_string(),
        title: title.to_string(),
        logo: None,
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

/// Default category table. Order matters: the first keyword hit wins.
pub fn builtin_definitions() -> RegistryFile {
    RegistryFile {
        fallback: "sin_clasificar".to_string(),
        exclusions: [
            "religion", "evangelio", "cristo", "biblia", "jesus", "adoracion", "misa",
            "rosario", "adblock", "test", "vacio", "publicidad", "anuncio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        categories: vec![
            def(
                "tv_argentina",
                "★ TV ARGENTINA ★",
                &["argentina", "telefe", "el trece", "eltrece", "america tv", "tv publica", "c5n", "a24", "tyc"],
            ),
            def(
                "infantil_educativo",
                "★ INFANTIL EDUCATIVO ★",
                &["infantil", "kids", "disney", "cartoon", "nick", "dibujos", "baby", "educativo"],
            ),
            def(
                "musica_latina",
                "★ MÚSICA LATINA ★",
                &["musica", "music", "mtv", "concierto", "hits", "reggaeton", "cumbia", "salsa"],
            ),
            def(
                "deportes",
                "★ DEPORTES ★",
                &["deporte", "sport", "espn", "futbol", "football", "dazn", "nba"],
            ),
            def(
                "documental_cultural",
                "★ DOCUMENTALES ★",
                &["documental", "discovery", "history", "historia", "nat geo", "natgeo", "national geographic", "animal planet", "naturaleza", "cultura"],
            ),
            def("cine_terror", "★ TERROR ★", &["terror", "horror", "miedo"]),
            def("estrenos", "★ ESTRENOS ★", &["estreno", "premiere"]),
            def("sagas", "★ SAGAS ★", &["saga", "coleccion", "collection", "trilogia"]),
            def(
                "series",
                "★ SERIES ★",
                &["serie", "temporada", "season", "capitulo", "episodio", "novela", "anime"],
            ),
            def("peliculas", "★ PELICULAS ★", &["pelicula", "movie", "film", "cine"]),
            def("iptv", "★ TELEVISION ★", &["noticias", "news", "canal", "channel", "tv"]),
            def("roll_over_general", "★ CANALES ROLL-OVER/OTROS ★", &[]),
            def("sin_clasificar", "★ SIN CLASIFICAR ★", &[]),
        ],
    }
}

/// Small registry for unit tests: keys in order, no keywords, first key is fallback
#[cfg(test)]
pub fn test_registry(keys: &[&str]) -> CategoryRegistry {
    CategoryRegistry::from_definitions(RegistryFile {
        fallback: keys[0].to_string(),
        exclusions: vec![],
        categories: keys
            .iter()
            .map(|k| def(k, &format!("★ {} ★", k.to_uppercase()), &[]))
            .collect(),
    })
    .unwrap()
}
