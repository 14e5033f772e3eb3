use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::api;
use crate::config;
use crate::data::{
    ApiCommentService, ApiFeedService, ApiFriendService, ApiProfileService, MockCommentService,
    MockFeedService, MockFriendService, MockProfileService,
};
use crate::logging;
use crate::session;
use crate::ui;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    /// Use in-memory services instead of the backend.
    pub demo: bool,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;

    if let Err(err) = logging::init(&cfg.logging) {
        eprintln!("warning: {err:#}");
    }
    info!(demo = opts.demo, base_url = %cfg.api.base_url, "starting social-tui");

    let options = if opts.demo {
        demo_options(&cfg)
    } else {
        api_options(&cfg)?
    };

    let mut model = ui::Model::new(options);
    model.run()?;
    info!("bye");
    Ok(())
}

fn api_options(cfg: &config::Config) -> Result<ui::Options> {
    let session = Arc::new(session::Manager::new(Some(cfg.api.token.clone())));
    let client = api::Client::new(
        session.clone(),
        api::ClientConfig {
            user_agent: cfg.api.user_agent.clone(),
            base_url: Some(cfg.api.base_url.clone()),
            timeout: Some(cfg.api.timeout),
            http_client: None,
        },
    )
    .context("create api client")?;
    let client = Arc::new(client);

    let status = if cfg.api.token.trim().is_empty() {
        "No access token configured".to_string()
    } else {
        format!("Loading feed from {}…", client.base_url())
    };

    Ok(ui::Options {
        status_message: status,
        page_size: cfg.ui.page_size,
        feed_service: Arc::new(ApiFeedService::new(client.clone())),
        comment_service: Arc::new(ApiCommentService::new(client.clone())),
        friend_service: Arc::new(ApiFriendService::new(client.clone())),
        profile_service: Arc::new(ApiProfileService::new(client)),
        session,
    })
}

fn demo_options(cfg: &config::Config) -> ui::Options {
    ui::Options {
        status_message: "Demo mode: nothing leaves this machine".to_string(),
        page_size: cfg.ui.page_size,
        feed_service: Arc::new(MockFeedService),
        comment_service: Arc::new(MockCommentService::default()),
        friend_service: Arc::new(MockFriendService::default()),
        profile_service: Arc::new(MockProfileService),
        session: Arc::new(session::Manager::new(Some("demo".to_string()))),
    }
}
