//! End-to-end installer behaviour over `file://` sources and shell recipes.
#![cfg(unix)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::compiler::{CompilerDescriptor, CompilerFlags, CompilerPaths, CompilerRegistry};
use kiln_core::concretize::{Concretizer, HostArch};
use kiln_core::config::InstallSettings;
use kiln_core::installer::{InstallError, InstallOptions, InstallState, Installer, Mode, Outcome};
use kiln_core::installer::{BuildContext, BuildError};
use kiln_core::repo::{BoxError, Recipe, RecipeDecl, Registry, RepoError, Repository, TomlRecipe};
use kiln_core::{KilnPaths, NullReporter};
use kiln_schema::{AbstractSpec, ConcreteSpec, Sha256Digest, Version};
use tempfile::TempDir;

const OS: &str = "testos1";

struct TestContext {
    dir: TempDir,
    paths: KilnPaths,
    repo: Repository,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = KilnPaths::under(dir.path().join("home"));
        let repo = Repository::create(&paths.repo_roots[0], "builtin").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        Self { dir, paths, repo }
    }

    /// A tarball for `name-version` and its digest.
    fn tarball(&self, name: &str, version: &str) -> (PathBuf, Sha256Digest) {
        let path = self.dir.path().join("src").join(format!("{name}-{version}.tar.gz"));
        let gz = flate2::write::GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let body = format!("{name} {version}\n");
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{name}-{version}/README"), body.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        let digest = Sha256Digest::of_bytes(&std::fs::read(&path).unwrap());
        (path, digest)
    }

    /// Write `packages/<name>/package.toml` with a single 1.0 version.
    fn recipe(&self, name: &str, extra: &str) {
        let (tar, digest) = self.tarball(name, "1.0");
        self.recipe_with_digest(name, &tar, digest.as_str(), extra);
    }

    fn recipe_with_digest(&self, name: &str, tar: &Path, sha256: &str, extra: &str) {
        let dir = self.repo.root().join("packages").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let body = format!(
            "{extra}\n[[versions]]\nversion = \"1.0\"\nurl = \"file://{}\"\nsha256 = \"{sha256}\"\n",
            tar.display()
        );
        std::fs::write(dir.join("package.toml"), body).unwrap();
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn registry(&self) -> Arc<Registry> {
        Arc::new(Registry::new(&self.paths.repo_roots).unwrap())
    }

    fn compiler() -> CompilerDescriptor {
        let version = Version::parse("12.3.0").unwrap();
        CompilerDescriptor {
            alias: CompilerDescriptor::default_alias("gcc", &version),
            name: "gcc".into(),
            version,
            operating_system: OS.into(),
            paths: CompilerPaths {
                cc: Some(PathBuf::from("/usr/bin/cc")),
                ..CompilerPaths::default()
            },
            modules: Vec::new(),
            flags: CompilerFlags::default(),
        }
    }

    fn compilers(&self) -> Arc<CompilerRegistry> {
        Arc::new(CompilerRegistry::with_detector(self.paths.scopes.clone(), || {
            vec![Self::compiler()]
        }))
    }

    fn concretize(&self, registry: &Registry, request: &str) -> Arc<ConcreteSpec> {
        let host = HostArch {
            platform: "linux".into(),
            os: OS.into(),
            target: "x86_64".into(),
        };
        Concretizer::new(registry, vec![Self::compiler()], host)
            .concretize(&AbstractSpec::parse(request).unwrap())
            .unwrap()
    }

    fn installer(&self, registry: Arc<Registry>) -> Installer {
        self.installer_with(registry, InstallSettings::default())
    }

    fn installer_with(&self, registry: Arc<Registry>, settings: InstallSettings) -> Installer {
        let settings = InstallSettings {
            jobs: 2,
            build_jobs: 1,
            ..settings
        };
        Installer::new(&self.paths, registry, self.compilers(), settings, Arc::new(NullReporter))
    }

    fn count_lines(&self, name: &str) -> usize {
        std::fs::read_to_string(self.marker(name))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

/// Delegates to a declarative recipe but panics in its `build` phase.
#[derive(Debug)]
struct PanicsInBuild(TomlRecipe);

#[async_trait::async_trait]
impl Recipe for PanicsInBuild {
    fn decl(&self) -> &RecipeDecl {
        self.0.decl()
    }

    async fn run_phase(&self, phase: &str, ctx: &BuildContext) -> Result<(), BuildError> {
        if phase == "build" {
            panic!("recipe bug in {phase}");
        }
        self.0.run_phase(phase, ctx).await
    }
}

/// Recipe body whose install step creates the prefix and appends to a counter.
fn installing(counter: &Path) -> String {
    format!(
        "[steps]\ninstall = \"mkdir -p \\\"$PREFIX\\\" && echo built >> {}\"\n",
        counter.display()
    )
}

#[tokio::test]
async fn test_install_creates_prefix_and_record() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", &installing(&ctx.marker("zlib.count")));
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "zlib");
    let installer = ctx.installer(registry);

    let prefix = installer.install(&spec).await.unwrap();
    assert!(prefix.is_dir());
    assert!(prefix.starts_with(&ctx.paths.install_root));
    assert_eq!(installer.layout().read_metadata(&prefix).unwrap().hash(), spec.hash());

    let records = installer.records(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, InstallState::Installed);
    assert!(!installer.stage_for(&spec).path().exists());

    // A second request is a no-op.
    let again = installer.install(&spec).await.unwrap();
    assert_eq!(again, prefix);
    assert_eq!(ctx.count_lines("zlib.count"), 1);
}

#[tokio::test]
async fn test_failing_middle_phase_rolls_back() {
    let ctx = TestContext::new();
    let steps = format!(
        "phases = [\"configure\", \"build\", \"install\"]\n\
         [steps]\n\
         configure = \"mkdir -p \\\"$PREFIX\\\" && touch \\\"$PREFIX\\\"/partial\"\n\
         build = \"echo compiling; exit 3\"\n\
         install = \"touch {}\"\n",
        ctx.marker("installed").display()
    );
    ctx.recipe("broken", &steps);
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "broken");
    let installer = ctx.installer(registry);

    let err = installer.install(&spec).await.unwrap_err();
    assert!(matches!(err, InstallError::InstallFailed { .. }));
    match err.root_cause() {
        InstallError::Phase { phase, .. } => assert_eq!(phase, "build"),
        other => panic!("unexpected cause {other:?}"),
    }
    assert_eq!(err.root_cause().kind(), "CommandFailed");

    assert!(!installer.layout().prefix(&spec).exists());
    assert!(!ctx.marker("installed").exists());
    let records = installer.records(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, InstallState::Failed);
    assert!(!records[0].is_live());
}

#[tokio::test]
async fn test_shared_dependency_is_built_once() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", &installing(&ctx.marker("zlib.count")));
    for app in ["app1", "app2"] {
        let body = format!(
            "[[dependencies]]\nspec = \"zlib\"\n\n{}",
            installing(&ctx.marker(&format!("{app}.count")))
        );
        ctx.recipe(app, &body);
    }
    let registry = ctx.registry();
    let roots = vec![ctx.concretize(&registry, "app1"), ctx.concretize(&registry, "app2")];
    let installer = ctx.installer(registry);

    let report = installer.install_all(&roots, &InstallOptions::default()).await;
    assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.nodes.len(), 3);
    assert_eq!(report.built(), 3);
    assert_eq!(ctx.count_lines("zlib.count"), 1);
    assert_eq!(ctx.count_lines("app1.count"), 1);

    let report = installer.install_all(&roots, &InstallOptions::default()).await;
    assert_eq!(report.built(), 0);
    assert!(report
        .nodes
        .iter()
        .all(|(_, o)| matches!(o, Outcome::AlreadyInstalled(_))));
    assert_eq!(ctx.count_lines("zlib.count"), 1);
}

#[tokio::test]
async fn test_dependents_of_failed_node_are_skipped() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", "[steps]\ninstall = \"exit 1\"\n");
    ctx.recipe(
        "libpng",
        &format!("[[dependencies]]\nspec = \"zlib\"\n\n{}", installing(&ctx.marker("libpng.count"))),
    );
    ctx.recipe("cmake", &installing(&ctx.marker("cmake.count")));
    let registry = ctx.registry();
    let libpng = ctx.concretize(&registry, "libpng");
    let cmake = ctx.concretize(&registry, "cmake");
    let installer = ctx.installer(registry);

    let report = installer
        .install_all(&[Arc::clone(&libpng), Arc::clone(&cmake)], &InstallOptions::default())
        .await;
    assert!(!report.is_success());
    assert!(matches!(
        report.outcome(libpng.hash()),
        Some(Outcome::Failed(InstallError::DependencyFailed { dependency, .. })) if dependency.starts_with("zlib")
    ));
    assert!(matches!(report.outcome(cmake.hash()), Some(Outcome::Installed(_))));
    assert_eq!(ctx.count_lines("libpng.count"), 0);
}

#[tokio::test]
async fn test_uninstall_refuses_live_dependents() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", &installing(&ctx.marker("zlib.count")));
    ctx.recipe(
        "libpng",
        &format!("[[dependencies]]\nspec = \"zlib\"\n\n{}", installing(&ctx.marker("libpng.count"))),
    );
    let registry = ctx.registry();
    let libpng = ctx.concretize(&registry, "libpng");
    let zlib = Arc::clone(&libpng.dependency("zlib").unwrap().spec);
    let installer = ctx.installer(registry);
    installer.install(&libpng).await.unwrap();

    let err = installer.uninstall(&zlib, false).await.unwrap_err();
    match &err {
        InstallError::DependentsExist { names, .. } => {
            assert_eq!(names.len(), 1);
            assert!(names[0].starts_with("libpng"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(installer.layout().prefix(&zlib).is_dir());

    let removed = installer.uninstall(&libpng, false).await.unwrap();
    assert!(!removed.exists());
    installer.uninstall(&zlib, false).await.unwrap();
    assert!(installer.records(None).await.unwrap().is_empty());

    let err = installer.uninstall(&zlib, false).await.unwrap_err();
    assert_eq!(err.kind(), "NotInstalled");
}

#[tokio::test]
async fn test_wrong_checksum_fails_before_build() {
    let ctx = TestContext::new();
    let (tar, _) = ctx.tarball("zlib", "1.0");
    let wrong = Sha256Digest::of_bytes(b"not the archive");
    ctx.recipe_with_digest("zlib", &tar, wrong.as_str(), &installing(&ctx.marker("zlib.count")));
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "zlib");
    let installer = ctx.installer(registry);

    let err = installer.install(&spec).await.unwrap_err();
    assert_eq!(err.root_cause().kind(), "ChecksumMismatch");
    assert_eq!(ctx.count_lines("zlib.count"), 0);
    assert!(!installer.layout().prefix(&spec).exists());
}

#[tokio::test]
async fn test_missing_prefix_fails_verification() {
    let ctx = TestContext::new();
    ctx.recipe("noop", "[steps]\ninstall = \"true\"\n");
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "noop");
    let installer = ctx.installer(registry);

    let err = installer.install(&spec).await.unwrap_err();
    assert_eq!(err.root_cause().kind(), "InstallVerificationFailed");
    let records = installer.records(None).await.unwrap();
    assert_eq!(records[0].state, InstallState::Failed);
}

#[tokio::test]
async fn test_fetch_only_expands_without_recording() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", &installing(&ctx.marker("zlib.count")));
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "zlib");
    let installer = ctx.installer(registry);

    let options = InstallOptions {
        mode: Mode::Fetch { dependencies: false },
        ..InstallOptions::default()
    };
    let report = installer.install_all(std::slice::from_ref(&spec), &options).await;
    assert!(matches!(report.outcome(spec.hash()), Some(Outcome::Fetched)));
    let readme = installer.stage_for(&spec).source_path().join("README");
    assert_eq!(std::fs::read_to_string(readme).unwrap(), "zlib 1.0\n");
    assert!(installer.records(None).await.unwrap().is_empty());
    assert_eq!(ctx.count_lines("zlib.count"), 0);
}

#[test]
fn test_second_builtin_repository_is_rejected() {
    let ctx = TestContext::new();
    let other = ctx.dir.path().join("other");
    Repository::create(&other, "builtin").unwrap();
    let roots = vec![ctx.paths.repo_roots[0].clone(), other];
    let err = Registry::new(&roots).unwrap_err();
    assert!(matches!(err, RepoError::DuplicateRepository { .. }));
}

#[tokio::test]
async fn test_panicking_phase_rolls_back() {
    let ctx = TestContext::new();
    ctx.recipe(
        "boom",
        "phases = [\"configure\", \"build\", \"install\"]\n\
         [steps]\n\
         configure = \"mkdir -p \\\"$PREFIX\\\" && touch \\\"$PREFIX\\\"/partial\"\n\
         build = \"true\"\n\
         install = \"true\"\n",
    );
    let file = ctx.repo.root().join("packages").join("boom").join("package.toml");
    let registry = Registry::new(&ctx.paths.repo_roots)
        .unwrap()
        .register("builtin", "boom", move |_| -> Result<Arc<dyn Recipe>, BoxError> {
            Ok(Arc::new(PanicsInBuild(TomlRecipe::load("boom", &file)?)))
        });
    let registry = Arc::new(registry);
    let spec = ctx.concretize(&registry, "boom");
    let installer = ctx.installer(registry);

    let err = installer.install(&spec).await.unwrap_err();
    assert!(matches!(err, InstallError::InstallFailed { .. }));
    assert!(matches!(err.root_cause(), InstallError::Panicked(_)));
    assert!(!installer.layout().prefix(&spec).exists());
    let records = installer.records(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, InstallState::Failed);
}

#[tokio::test]
async fn test_uninstall_waits_for_the_prefix_lock() {
    let ctx = TestContext::new();
    ctx.recipe("zlib", &installing(&ctx.marker("zlib.count")));
    let registry = ctx.registry();
    let spec = ctx.concretize(&registry, "zlib");
    let settings = InstallSettings {
        lock_timeout: Duration::from_millis(200),
        ..InstallSettings::default()
    };
    let installer = ctx.installer_with(registry, settings);
    let prefix = installer.install(&spec).await.unwrap();

    let held = installer.database().lock_prefix(spec.hash()).unwrap();
    let err = installer.uninstall(&spec, false).await.unwrap_err();
    assert_eq!(err.kind(), "LockTimeout");
    assert!(prefix.is_dir());
    assert_eq!(installer.records(None).await.unwrap().len(), 1);

    drop(held);
    installer.uninstall(&spec, false).await.unwrap();
    assert!(!prefix.exists());
}
