//! Small CLI that exercises the kernel end-to-end: submits a few tasks,
//! publishes a message, and prints a metrics snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use spiral_kernel::agent::Agent;
use spiral_kernel::config::KernelConfig;
use spiral_kernel::error::Result;
use spiral_kernel::kernel::Kernel;
use spiral_kernel::metrics::ExportFormat;
use spiral_kernel::priority::Priority;
use spiral_kernel::queue::Task;

#[derive(Parser, Debug)]
#[command(name = "spiral-kernel", about = "Runtime kernel demo")]
struct Cli {
    /// Number of demo tasks to submit.
    #[arg(long, default_value_t = 5)]
    tasks: usize,

    /// Number of worker agents to register.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// How long to let the pool run before reporting, in milliseconds.
    #[arg(long, default_value_t = 500)]
    run_millis: u64,
}

struct LoggingAgent {
    id: String,
}

#[async_trait]
impl Agent for LoggingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, task: &Task) -> Result<Vec<u8>> {
        tracing::info!(agent = %self.id, task = %task.id, "executing task");
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(task.payload.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let kernel = Arc::new(Kernel::new(KernelConfig::default()));

    for i in 0..cli.workers {
        kernel
            .pool
            .add_worker(Arc::new(LoggingAgent {
                id: format!("worker-{i}"),
            }))
            .await;
    }

    for i in 0..cli.tasks {
        let priority = match i % 3 {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        kernel
            .queue
            .enqueue(Task::new(format!("demo-{i}"), priority, vec![i as u8]))
            .await;
    }

    kernel
        .broker
        .publish(
            "demo",
            serde_json::json!({ "event": "startup" }),
            Priority::Normal,
            Some("demo-cli".to_string()),
            Default::default(),
        )
        .await;

    let kernel_handle = kernel.clone();
    let pool_task = tokio::spawn(async move { kernel_handle.pool.clone().run().await });

    tokio::time::sleep(Duration::from_millis(cli.run_millis)).await;
    kernel.pool.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(1), pool_task).await;

    let stats = kernel.pool.stats().await;
    println!(
        "pool: {} workers, {} completed, {} failed",
        stats.worker_count, stats.tasks_completed, stats.tasks_failed
    );
    println!("{}", kernel.metrics.export(ExportFormat::Text));

    Ok(())
}
