//! Registry of supported languages, fuzzing engines and runtime images.
//!
//! Loaded once at process start from a YAML definition (or the built-in seed)
//! and treated as read-only afterwards. All cross-references between sections
//! are checked at load time; queries never re-validate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(LangId);
string_id!(EngineId);
string_id!(ImageId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    pub id: LangId,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub id: EngineId,
    pub display_name: String,
    /// Languages this engine can fuzz. Every entry must name a known language.
    pub langs: Vec<LangId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStatus {
    Ready,
    NotReady,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ImageStatus,
    /// Engines preinstalled in this image. Every entry must name a known engine.
    pub engines: Vec<EngineId>,
}

/// Serde shape of a catalog source. Section order is preserved into the
/// loaded catalog and is observable (implicit image selection relies on it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDef {
    #[serde(default)]
    pub langs: Vec<Language>,
    #[serde(default)]
    pub engines: Vec<Engine>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate language id '{0}'")]
    DuplicateLanguage(LangId),
    #[error("duplicate engine id '{0}'")]
    DuplicateEngine(EngineId),
    #[error("duplicate image id '{0}'")]
    DuplicateImage(ImageId),
    #[error("engine '{engine}' references unknown language '{lang}'")]
    UnknownLanguageRef { engine: EngineId, lang: LangId },
    #[error("image '{image}' references unknown engine '{engine}'")]
    UnknownEngineRef { image: ImageId, engine: EngineId },
    #[error("failed to read catalog source: {0}")]
    Source(String),
}

#[derive(Debug)]
pub struct Catalog {
    langs: Vec<Language>,
    engines: Vec<Engine>,
    images: Vec<Image>,
    lang_index: HashMap<LangId, usize>,
    engine_index: HashMap<EngineId, usize>,
    image_index: HashMap<ImageId, usize>,
}

impl Catalog {
    /// Build a catalog, failing fast on duplicate ids or dangling references.
    pub fn load(def: CatalogDef) -> Result<Self, CatalogError> {
        let mut lang_index = HashMap::with_capacity(def.langs.len());
        for (i, lang) in def.langs.iter().enumerate() {
            if lang_index.insert(lang.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateLanguage(lang.id.clone()));
            }
        }

        let mut engine_index = HashMap::with_capacity(def.engines.len());
        for (i, engine) in def.engines.iter().enumerate() {
            if engine_index.insert(engine.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateEngine(engine.id.clone()));
            }
            for lang in &engine.langs {
                if !lang_index.contains_key(lang) {
                    return Err(CatalogError::UnknownLanguageRef {
                        engine: engine.id.clone(),
                        lang: lang.clone(),
                    });
                }
            }
        }

        let mut image_index = HashMap::with_capacity(def.images.len());
        for (i, image) in def.images.iter().enumerate() {
            if image_index.insert(image.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateImage(image.id.clone()));
            }
            for engine in &image.engines {
                if !engine_index.contains_key(engine) {
                    return Err(CatalogError::UnknownEngineRef {
                        image: image.id.clone(),
                        engine: engine.clone(),
                    });
                }
            }
        }

        Ok(Self {
            langs: def.langs,
            engines: def.engines,
            images: def.images,
            lang_index,
            engine_index,
            image_index,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let def: CatalogDef =
            serde_yaml::from_str(text).map_err(|e| CatalogError::Source(e.to_string()))?;
        Self::load(def)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CatalogError::Source(e.to_string()))?;
        Self::from_yaml_str(&text)
    }

    pub fn languages(&self) -> &[Language] { &self.langs }
    pub fn engines(&self) -> &[Engine] { &self.engines }
    pub fn images(&self) -> &[Image] { &self.images }

    pub fn language(&self, id: &LangId) -> Option<&Language> {
        self.lang_index.get(id).map(|&i| &self.langs[i])
    }

    pub fn engine(&self, id: &EngineId) -> Option<&Engine> {
        self.engine_index.get(id).map(|&i| &self.engines[i])
    }

    pub fn image(&self, id: &ImageId) -> Option<&Image> {
        self.image_index.get(id).map(|&i| &self.images[i])
    }

    /// The default registry shipped with the platform.
    pub fn builtin() -> Self {
        Self::load(builtin_def()).expect("builtin catalog definition is self-consistent")
    }
}

fn lang(id: &str, display_name: &str) -> Language {
    Language { id: id.into(), display_name: display_name.to_string() }
}

fn engine(id: &str, display_name: &str, langs: &[&str]) -> Engine {
    Engine {
        id: id.into(),
        display_name: display_name.to_string(),
        langs: langs.iter().map(|&l| l.into()).collect(),
    }
}

fn image(id: &str, name: &str, status: ImageStatus, engines: &[&str]) -> Image {
    Image {
        id: id.into(),
        name: name.to_string(),
        description: format!("Built-in runtime image {name}"),
        status,
        engines: engines.iter().map(|&e| e.into()).collect(),
    }
}

fn builtin_def() -> CatalogDef {
    const ALL_ENGINES: &[&str] = &[
        "afl",
        "libfuzzer",
        "afl.rs",
        "cargo-fuzz",
        "jazzer",
        "atheris",
        "go-fuzz-libfuzzer",
    ];
    CatalogDef {
        langs: vec![
            lang("go", "Go"),
            lang("cpp", "C++"),
            lang("rust", "Rust"),
            lang("java", "Java"),
            lang("swift", "Swift"),
            lang("python", "Python"),
        ],
        engines: vec![
            engine("afl", "AFL++", &["cpp"]),
            engine("libfuzzer", "LibFuzzer", &["cpp", "swift"]),
            engine("afl.rs", "afl.rs", &["rust"]),
            engine("cargo-fuzz", "cargo-fuzz", &["rust"]),
            engine("jazzer", "Jazzer", &["java"]),
            engine("atheris", "Atheris", &["python"]),
            engine("go-fuzz-libfuzzer", "go-fuzz (libFuzzer mode)", &["go"]),
        ],
        images: vec![
            image("ubuntu-18.04", "Ubuntu 18.04", ImageStatus::Ready, &["afl", "libfuzzer"]),
            image("ubuntu-20.04", "Ubuntu 20.04", ImageStatus::Ready, ALL_ENGINES),
            image("ubuntu-22.04", "Ubuntu 22.04", ImageStatus::Ready, ALL_ENGINES),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.languages().len(), 6);
        assert_eq!(catalog.engines().len(), 7);
        assert_eq!(catalog.images().len(), 3);
        assert!(catalog.engine(&"atheris".into()).is_some());
        assert!(catalog.image(&"ubuntu-18.04".into()).is_some());
        assert!(catalog.language(&"cobol".into()).is_none());
    }

    #[test]
    fn duplicate_language_rejected() {
        let def = CatalogDef {
            langs: vec![lang("cpp", "C++"), lang("cpp", "C++ again")],
            ..Default::default()
        };
        assert_eq!(
            Catalog::load(def).unwrap_err(),
            CatalogError::DuplicateLanguage("cpp".into())
        );
    }

    #[test]
    fn dangling_engine_lang_rejected() {
        let def = CatalogDef {
            langs: vec![lang("cpp", "C++")],
            engines: vec![engine("afl", "AFL++", &["cpp", "fortran"])],
            ..Default::default()
        };
        assert_eq!(
            Catalog::load(def).unwrap_err(),
            CatalogError::UnknownLanguageRef { engine: "afl".into(), lang: "fortran".into() }
        );
    }

    #[test]
    fn dangling_image_engine_rejected() {
        let def = CatalogDef {
            langs: vec![lang("cpp", "C++")],
            engines: vec![engine("afl", "AFL++", &["cpp"])],
            images: vec![image("img-1", "img", ImageStatus::Ready, &["afl", "honggfuzz"])],
        };
        assert_eq!(
            Catalog::load(def).unwrap_err(),
            CatalogError::UnknownEngineRef { image: "img-1".into(), engine: "honggfuzz".into() }
        );
    }

    #[test]
    fn yaml_source_round_trips_insertion_order() {
        let text = r#"
langs:
  - { id: cpp, display_name: "C++" }
engines:
  - { id: libfuzzer, display_name: LibFuzzer, langs: [cpp] }
images:
  - { id: img-b, name: B, status: Ready, engines: [libfuzzer] }
  - { id: img-a, name: A, status: NotReady, engines: [libfuzzer] }
"#;
        let catalog = Catalog::from_yaml_str(text).unwrap();
        let ids: Vec<_> = catalog.images().iter().map(|i| i.id.0.as_str()).collect();
        assert_eq!(ids, ["img-b", "img-a"]);
        assert_eq!(catalog.image(&"img-a".into()).unwrap().status, ImageStatus::NotReady);
    }
}
