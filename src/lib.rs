pub mod app;
pub mod chat;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod render;
pub mod server;
pub mod transcript;

#[cfg(test)]
mod testing;

use cli::Args;
use config::prompt::load_prompts;
use log::{ info, warn };
use server::{ Server, ServiceContext };
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let llm = args.llm_config();
    let options = args.app_options();

    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP API Port: {}", args.http_port.map_or("disabled".to_string(), |p| p.to_string()));
    info!("Model: {}", llm.model);
    info!("Model Base URL: {}", llm.base_url);
    info!("API Key: {}", if llm.credential().is_some() { "set" } else { "not set" });
    info!("Chunk Timeout: {:?}", llm.chunk_timeout);
    info!("Diagnosis Timeout: {:?}", llm.diagnosis_timeout);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("(built-in)"));
    info!("Max Image Bytes: {}", options.max_image_bytes);
    info!("Speech Language: {}", options.speech_lang);
    info!("Reset Session On New Chat: {}", options.reset_session_on_new_chat);
    info!("-------------------------");

    if let Some(warning) = gateway::check_credential(llm.credential()) {
        warn!("{}", warning);
    }

    let prompts = load_prompts(args.prompts_path.as_deref())?;
    let context = Arc::new(ServiceContext::from_config(llm, prompts, options)?);

    info!("Starting server on: {}", args.server_addr);
    let server = Server::new(args.server_addr.clone(), args.http_port, context);
    server.run().await?;

    Ok(())
}
