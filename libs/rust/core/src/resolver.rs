//! Compatibility resolution for (language, engine, image) job requests.
//!
//! Resolution is a pure function of catalog state and input: no side effects,
//! and the implicit image pick ties break by catalog insertion order.

use crate::catalog::{Catalog, EngineId, ImageId, ImageStatus, LangId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A validated (language, engine, image) combination, ready to dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityTriple {
    pub lang: LangId,
    pub engine: EngineId,
    pub image: ImageId,
}

/// Why a requested combination cannot run. Caller input is wrong in every
/// case; none of these are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("unknown language '{0}'")]
    UnknownLanguage(LangId),
    #[error("unknown engine '{0}'")]
    UnknownEngine(EngineId),
    #[error("unknown image '{0}'")]
    UnknownImage(ImageId),
    #[error("engine '{engine}' does not support language '{lang}'")]
    LanguageNotSupportedByEngine { lang: LangId, engine: EngineId },
    #[error("image '{image}' is not ready ({status:?})")]
    ImageNotReady { image: ImageId, status: ImageStatus },
    #[error("image '{image}' does not provide engine '{engine}'")]
    EngineNotSupportedByImage { image: ImageId, engine: EngineId },
    #[error("no ready image provides engine '{0}'")]
    NoReadyImage(EngineId),
}

pub struct Resolver {
    catalog: Arc<Catalog>,
}

impl Resolver {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn resolve(
        &self,
        lang: &LangId,
        engine: &EngineId,
        image: Option<&ImageId>,
    ) -> Result<CompatibilityTriple, RejectionReason> {
        if self.catalog.language(lang).is_none() {
            return Err(RejectionReason::UnknownLanguage(lang.clone()));
        }
        let engine_entry = self
            .catalog
            .engine(engine)
            .ok_or_else(|| RejectionReason::UnknownEngine(engine.clone()))?;
        if !engine_entry.langs.contains(lang) {
            return Err(RejectionReason::LanguageNotSupportedByEngine {
                lang: lang.clone(),
                engine: engine.clone(),
            });
        }

        let image_id = match image {
            Some(id) => {
                let entry = self
                    .catalog
                    .image(id)
                    .ok_or_else(|| RejectionReason::UnknownImage(id.clone()))?;
                if entry.status != ImageStatus::Ready {
                    return Err(RejectionReason::ImageNotReady {
                        image: id.clone(),
                        status: entry.status,
                    });
                }
                if !entry.engines.contains(engine) {
                    return Err(RejectionReason::EngineNotSupportedByImage {
                        image: id.clone(),
                        engine: engine.clone(),
                    });
                }
                id.clone()
            }
            None => self
                .catalog
                .images()
                .iter()
                .find(|img| img.status == ImageStatus::Ready && img.engines.contains(engine))
                .map(|img| img.id.clone())
                .ok_or_else(|| RejectionReason::NoReadyImage(engine.clone()))?,
        };

        Ok(CompatibilityTriple {
            lang: lang.clone(),
            engine: engine.clone(),
            image: image_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDef, Engine, Image, Language};

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(Catalog::builtin()))
    }

    #[test]
    fn explicit_image_resolves() {
        let triple = resolver()
            .resolve(&"cpp".into(), &"libfuzzer".into(), Some(&"ubuntu-18.04".into()))
            .unwrap();
        assert_eq!(triple.image, "ubuntu-18.04".into());
    }

    #[test]
    fn implicit_image_picks_first_ready_in_catalog_order() {
        // ubuntu-18.04 has no atheris; 20.04 comes before 22.04.
        let triple = resolver().resolve(&"python".into(), &"atheris".into(), None).unwrap();
        assert_eq!(triple.image, "ubuntu-20.04".into());
    }

    #[test]
    fn resolution_is_deterministic() {
        let r = resolver();
        let a = r.resolve(&"rust".into(), &"cargo-fuzz".into(), None);
        let b = r.resolve(&"rust".into(), &"cargo-fuzz".into(), None);
        assert_eq!(a, b);
    }

    #[test]
    fn lang_engine_mismatch_rejected() {
        let err = resolver().resolve(&"python".into(), &"afl".into(), None).unwrap_err();
        assert_eq!(
            err,
            RejectionReason::LanguageNotSupportedByEngine {
                lang: "python".into(),
                engine: "afl".into()
            }
        );
    }

    #[test]
    fn unknown_ids_rejected() {
        let r = resolver();
        assert_eq!(
            r.resolve(&"cobol".into(), &"afl".into(), None).unwrap_err(),
            RejectionReason::UnknownLanguage("cobol".into())
        );
        assert_eq!(
            r.resolve(&"cpp".into(), &"honggfuzz".into(), None).unwrap_err(),
            RejectionReason::UnknownEngine("honggfuzz".into())
        );
        assert_eq!(
            r.resolve(&"cpp".into(), &"afl".into(), Some(&"alpine-3".into())).unwrap_err(),
            RejectionReason::UnknownImage("alpine-3".into())
        );
    }

    #[test]
    fn image_engine_mismatch_rejected() {
        let err = resolver()
            .resolve(&"python".into(), &"atheris".into(), Some(&"ubuntu-18.04".into()))
            .unwrap_err();
        assert_eq!(
            err,
            RejectionReason::EngineNotSupportedByImage {
                image: "ubuntu-18.04".into(),
                engine: "atheris".into()
            }
        );
    }

    fn single_image_catalog(status: ImageStatus) -> Catalog {
        Catalog::load(CatalogDef {
            langs: vec![Language { id: "cpp".into(), display_name: "C++".into() }],
            engines: vec![Engine {
                id: "afl".into(),
                display_name: "AFL++".into(),
                langs: vec!["cpp".into()],
            }],
            images: vec![Image {
                id: "img-1".into(),
                name: "img".into(),
                description: String::new(),
                status,
                engines: vec!["afl".into()],
            }],
        })
        .unwrap()
    }

    #[test]
    fn not_ready_image_rejected() {
        let r = Resolver::new(Arc::new(single_image_catalog(ImageStatus::Deprecated)));
        let err = r.resolve(&"cpp".into(), &"afl".into(), Some(&"img-1".into())).unwrap_err();
        assert_eq!(
            err,
            RejectionReason::ImageNotReady {
                image: "img-1".into(),
                status: ImageStatus::Deprecated
            }
        );
    }

    #[test]
    fn no_ready_image_rejected() {
        let r = Resolver::new(Arc::new(single_image_catalog(ImageStatus::NotReady)));
        let err = r.resolve(&"cpp".into(), &"afl".into(), None).unwrap_err();
        assert_eq!(err, RejectionReason::NoReadyImage("afl".into()));
    }
}
