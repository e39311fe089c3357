pub mod api;
pub mod websocket;

use crate::app::AppOptions;
use crate::config::prompt::PromptConfig;
use crate::gateway::Gateway;
use crate::llm::{ build_http_client, GatewayError, LlmConfig };
use std::error::Error;
use std::sync::Arc;

type GatewayFactory = Arc<dyn Fn() -> Gateway + Send + Sync>;

/// What every connection needs to build its own [`Gateway`] and app.
pub struct ServiceContext {
    pub options: AppOptions,
    factory: GatewayFactory,
}

impl ServiceContext {
    pub fn new<F>(options: AppOptions, factory: F) -> Self where F: Fn() -> Gateway + Send + Sync + 'static {
        Self { options, factory: Arc::new(factory) }
    }

    /// Gemini-backed context. The HTTP client is built once and shared; each
    /// gateway gets its own conversational session.
    pub fn from_config(
        llm: LlmConfig,
        prompts: Arc<PromptConfig>,
        options: AppOptions
    ) -> Result<Self, GatewayError> {
        let http = build_http_client(llm.credential())?;
        Ok(Self::new(options, move || Gateway::from_config(&llm, http.clone(), &prompts)))
    }

    pub fn new_gateway(&self) -> Gateway {
        (self.factory)()
    }
}

pub struct Server {
    addr: String,
    http_port: Option<u16>,
    context: Arc<ServiceContext>,
}

impl Server {
    pub fn new(addr: String, http_port: Option<u16>, context: Arc<ServiceContext>) -> Self {
        Self {
            addr,
            http_port,
            context,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, self.context.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(&self.addr, self.context.clone()).await
    }
}
