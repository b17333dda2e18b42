use frameflow_master::config::{make_config_loader, MasterConfig};
use frameflow_master::tracing::init_tracing_with_default_env_filter;
use frameflow_master::{metrics, FrameflowMaster};
use prometheus::Registry;
use tokio::task::JoinSet;
use tracing::error;

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let prometheus = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config, prometheus))
    } else {
        Ok(())
    }
}

async fn async_main(config: MasterConfig, prometheus: Registry) -> Result<(), std::io::Error> {
    let mut join_set = JoinSet::new();

    let master = FrameflowMaster::new(config, prometheus).await.map_err(|e| {
        error!("Master - init error: {}", e);
        std::io::Error::other(format!("Init error: {e:?}"))
    })?;

    master
        .run(&mut join_set)
        .await
        .map_err(|e| std::io::Error::other(format!("Startup error: {e:?}")))?;

    while let Some(res) = join_set.join_next().await {
        res.map_err(std::io::Error::other)?
            .map_err(std::io::Error::other)?;
    }

    Ok(())
}
