//! Background services

pub mod sync;

use anyhow::Result;
use async_trait::async_trait;

/// A long-lived background service with an explicit lifecycle
#[async_trait]
pub trait Service: Send + Sync {
	fn name(&self) -> &'static str;

	fn is_running(&self) -> bool;

	async fn start(&self) -> Result<()>;

	async fn stop(&self) -> Result<()>;
}
