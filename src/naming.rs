//! Maps a test context to a cassette path.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::VcrError;

pub const CASSETTE_EXTENSION: &str = "jsonl";

/// Tag key for an explicit per-test cassette path.
pub const PATH_TAG: &str = "path";
/// Tag key for a simple per-test cassette name.
pub const NAME_TAG: &str = "name";

/// Everything the resolver (and user-supplied builders) can see about the
/// test frame being set up.
#[derive(Debug, Clone, Default)]
pub struct TestContext {
    pub test_name: String,
    pub module_path: String,
    pub tags: HashMap<String, String>,
    /// Optional context mapping populated by test setup.
    pub context: HashMap<String, String>,
}

/// A user function producing a relative cassette path (no extension).
pub type PathBuilder = Arc<dyn Fn(&TestContext) -> PathBuf + Send + Sync>;

#[derive(Clone, Default)]
pub struct NamingResolver {
    cassette_dir: PathBuf,
    named_builders: HashMap<String, PathBuilder>,
    global_builder: Option<PathBuilder>,
}

impl fmt::Debug for NamingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingResolver")
            .field("cassette_dir", &self.cassette_dir)
            .field(
                "named_builders",
                &self.named_builders.keys().collect::<Vec<_>>(),
            )
            .field("global_builder", &self.global_builder.is_some())
            .finish()
    }
}

impl NamingResolver {
    pub fn new(cassette_dir: impl Into<PathBuf>) -> Self {
        Self {
            cassette_dir: cassette_dir.into(),
            named_builders: HashMap::new(),
            global_builder: None,
        }
    }

    pub fn add_named_builder(&mut self, name: impl Into<String>, builder: PathBuilder) {
        self.named_builders.insert(name.into(), builder);
    }

    pub fn set_global_builder(&mut self, builder: PathBuilder) {
        self.global_builder = Some(builder);
    }

    /// Resolve the cassette path for a test frame. Priority: explicit
    /// `path` tag, then the named builder selected at frame construction,
    /// then the global builder, then the `name` tag, then
    /// `<module>/<test_name>`.
    pub fn resolve(
        &self,
        ctx: &TestContext,
        selected_builder: Option<&str>,
    ) -> Result<PathBuf, VcrError> {
        let relative = if let Some(path) = ctx.tags.get(PATH_TAG) {
            PathBuf::from(path)
        } else if let Some(name) = selected_builder {
            let builder = self.named_builders.get(name).ok_or_else(|| {
                VcrError::Config(format!("no cassette path builder named {name:?}"))
            })?;
            builder(ctx)
        } else if let Some(builder) = &self.global_builder {
            builder(ctx)
        } else if let Some(name) = ctx.tags.get(NAME_TAG) {
            PathBuf::from(name)
        } else {
            PathBuf::from(stripped_module_suffix(&ctx.module_path))
                .join(normalize_component(&ctx.test_name))
        };

        let file = format!("{}.{CASSETTE_EXTENSION}", relative.to_string_lossy());
        Ok(self.cassette_dir.join(file))
    }
}

/// Last segment of the module path, with a test-suffix trimmed off:
/// `my_app::users_api_test` becomes `users_api`.
fn stripped_module_suffix(module_path: &str) -> String {
    let last = module_path
        .rsplit("::")
        .next()
        .unwrap_or(module_path)
        .trim();
    let stripped = last
        .strip_suffix("_tests")
        .or_else(|| last.strip_suffix("_test"))
        .unwrap_or(last);
    normalize_component(stripped)
}

fn normalize_component(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
