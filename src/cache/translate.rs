//! Path-to-event translation.
//!
//! Repository change notifications arrive as paths. A translator turns them
//! into the event ids object-cache entries are registered under.

use super::error::TranslateError;

/// Maps a changed repository path to an event id.
pub trait EventPathTranslator<E>: Send + Sync {
    fn translate(&self, path: &str) -> Result<E, TranslateError>;
}

/// Maps any path below `root` to the path of the root's direct child that
/// contains it.
///
/// With root `/hst:hst/hst:configurations`, a change to
/// `/hst:hst/hst:configurations/foo/bar` becomes the event
/// `/hst:hst/hst:configurations/foo`, so everything cached for `foo` is
/// invalidated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPathTranslator {
    root: String,
}

impl RootPathTranslator {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = root.trim_end_matches('/').to_string();
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path of the root child containing `path`.
    pub fn root_child_path(&self, path: &str) -> Result<String, TranslateError> {
        let rest = path
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| TranslateError::OutsideRoot {
                path: path.to_string(),
                root: self.root.clone(),
            })?;

        let child = rest.split('/').next().unwrap_or_default();
        if child.is_empty() {
            return Err(TranslateError::MissingChild {
                path: path.to_string(),
                root: self.root.clone(),
            });
        }

        Ok(format!("{}/{}", self.root, child))
    }
}

impl EventPathTranslator<String> for RootPathTranslator {
    fn translate(&self, path: &str) -> Result<String, TranslateError> {
        self.root_child_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/hst:hst/hst:configurations";

    fn translator() -> RootPathTranslator {
        RootPathTranslator::new(ROOT)
    }

    #[test]
    fn nested_path_maps_to_root_child() {
        assert_eq!(
            translator().root_child_path("/hst:hst/hst:configurations/foo/bar"),
            Ok("/hst:hst/hst:configurations/foo".to_string())
        );
        assert_eq!(
            translator().root_child_path("/hst:hst/hst:configurations/foo"),
            Ok("/hst:hst/hst:configurations/foo".to_string())
        );
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        assert_eq!(
            translator().root_child_path("/hst:hst/hst:configurations/foo/"),
            Ok("/hst:hst/hst:configurations/foo".to_string())
        );
        assert_eq!(RootPathTranslator::new(format!("{ROOT}/")).root(), ROOT);
    }

    #[test]
    fn same_name_sibling_index_is_kept() {
        assert_eq!(
            translator().root_child_path("/hst:hst/hst:configurations/foo[1]/bar"),
            Ok("/hst:hst/hst:configurations/foo[1]".to_string())
        );
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        assert!(matches!(
            translator().root_child_path("invalid"),
            Err(TranslateError::OutsideRoot { .. })
        ));
        assert!(matches!(
            translator().root_child_path("/hst:hst/hst:configurationsfoo/bar"),
            Err(TranslateError::OutsideRoot { .. })
        ));
        assert!(matches!(
            translator().root_child_path(ROOT),
            Err(TranslateError::OutsideRoot { .. })
        ));
    }

    #[test]
    fn root_itself_has_no_child() {
        assert!(matches!(
            translator().root_child_path("/hst:hst/hst:configurations/"),
            Err(TranslateError::MissingChild { .. })
        ));
    }

    #[test]
    fn translate_uses_root_child_path() {
        let translator: &dyn EventPathTranslator<String> = &translator();
        assert_eq!(
            translator.translate("/hst:hst/hst:configurations/common/sitemap"),
            Ok("/hst:hst/hst:configurations/common".to_string())
        );
    }
}
