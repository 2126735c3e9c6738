mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sql_session::session::{DeriveFlags, Generation};
use sql_session::test_utils::MockDialector;
use sql_session::{Config, Db, Plugin, SessionDbError};

#[derive(Default)]
struct AuditPlugin {
    name: &'static str,
    fail: bool,
    inits: AtomicUsize,
    seen: Mutex<Option<Generation>>,
}

impl AuditPlugin {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn failing(name: &'static str) -> Self {
        Self {
            name,
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Plugin for AuditPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn initialize(&self, db: &Db) -> Result<(), SessionDbError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().expect("seen lock") = Some(db.generation());
        if self.fail {
            return Err(SessionDbError::ConfigError("audit table missing".into()));
        }
        let done = db
            .exec("CREATE TABLE IF NOT EXISTS audit (event TEXT)", &[])
            .await;
        match done.error() {
            Some(err) => Err(SessionDbError::Other(err.to_string())),
            None => Ok(()),
        }
    }
}

#[tokio::test]
async fn registers_once_per_name() -> Result<(), SessionDbError> {
    let (db, mock) = common::open_mock(Config::default()).await?;
    let audit = Arc::new(AuditPlugin::named("audit"));

    db.use_plugin(audit.clone()).await?;
    assert_eq!(db.plugin_names(), vec!["audit".to_string()]);
    assert!(db.plugin("audit").is_some());
    assert_eq!(
        mock.executed(),
        vec!["CREATE TABLE IF NOT EXISTS audit (event TEXT)".to_string()]
    );

    let dup = db
        .use_plugin(Arc::new(AuditPlugin::named("audit")))
        .await
        .expect_err("name already taken");
    assert!(matches!(dup, SessionDbError::PluginRegistered(name) if name == "audit"));
    assert_eq!(audit.inits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn registry_is_shared_by_the_lineage() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;
    let derived = db.instance();

    derived.use_plugin(Arc::new(AuditPlugin::named("audit"))).await?;
    assert!(db.plugin("audit").is_some());

    let err = db
        .use_plugin(Arc::new(AuditPlugin::named("audit")))
        .await
        .expect_err("registered through the derived handle");
    assert!(matches!(err, SessionDbError::PluginRegistered(_)));
    Ok(())
}

#[tokio::test]
async fn failed_initialization_leaves_registry_unchanged() -> Result<(), SessionDbError> {
    let (db, _mock) = common::open_mock(Config::default()).await?;
    db.use_plugin(Arc::new(AuditPlugin::named("metrics"))).await?;

    let err = db
        .use_plugin(Arc::new(AuditPlugin::failing("audit")))
        .await
        .expect_err("init fails");
    assert!(matches!(err, SessionDbError::PluginInit { ref name, .. } if name == "audit"));
    assert!(db.plugin("audit").is_none());
    assert_eq!(db.plugin_names(), vec!["metrics".to_string()]);

    // the name is free again
    db.use_plugin(Arc::new(AuditPlugin::named("audit"))).await?;
    assert_eq!(
        db.plugin_names(),
        vec!["audit".to_string(), "metrics".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn initialization_runs_on_a_root_handle() -> Result<(), SessionDbError> {
    let (db, mock) = common::open_mock(Config::default()).await?;
    let dry = db.session(DeriveFlags {
        dry_run: true,
        ..DeriveFlags::default()
    });
    assert_eq!(dry.generation(), Generation::IsolatedClone);

    let audit = Arc::new(AuditPlugin::named("audit"));
    dry.use_plugin(audit.clone()).await?;

    assert_eq!(*audit.seen.lock().expect("seen lock"), Some(Generation::Root));
    // the caller's dry run does not reach the plugin's setup
    assert_eq!(
        mock.executed(),
        vec!["CREATE TABLE IF NOT EXISTS audit (event TEXT)".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn configured_plugins_install_at_open() -> Result<(), SessionDbError> {
    let audit = Arc::new(AuditPlugin::named("audit"));
    let config = Config::builder().plugin(audit.clone()).finish();
    assert_eq!(config.plugin_names(), vec!["audit".to_string()]);

    let (db, _mock) = common::open_mock(config).await?;
    assert!(db.plugin("audit").is_some());
    assert_eq!(audit.inits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn open_fails_when_a_configured_plugin_fails() {
    common::init_tracing();
    let config = Config::builder()
        .plugin(Arc::new(AuditPlugin::failing("audit")))
        .finish();

    let err = Db::open(MockDialector::new(Default::default()), config)
        .await
        .expect_err("plugin init fails");
    assert!(matches!(err, SessionDbError::PluginInit { .. }));
}

#[tokio::test]
async fn refused_connection_fails_open_before_plugins() {
    common::init_tracing();
    let audit = Arc::new(AuditPlugin::named("audit"));
    let config = Config::builder().plugin(audit.clone()).finish();

    let err = Db::open(MockDialector::refusing(), config)
        .await
        .expect_err("dialector refuses");
    assert!(matches!(err, SessionDbError::ConnectionError(_)));
    assert_eq!(audit.inits.load(Ordering::SeqCst), 0);
}
