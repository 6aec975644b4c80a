use clap::Parser;
use demos::{init_logger, Overrides};
use log::{error, info};
use mqtt_engine::{broker::Broker, config::Config};

/// 单节点 mqtt broker，使用内存引擎
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./standalone.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _logger = init_logger()?;

    // 获取配置
    let mut cfg = Config::from_path(&args.config).await?;
    Overrides::from_env()?.apply(&mut cfg);
    info!("load config from {}", args.config);

    // 启动 broker
    let broker = Broker::new(cfg);
    tokio::select! {
        res = broker.start() => {
            if let Err(e) = &res {
                error!("broker exit error: {}", e);
            }
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c");
            broker.shutdown();
        }
    }
    Ok(())
}
