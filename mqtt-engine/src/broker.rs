use std::{sync::Arc, time::Duration};

use log::{debug, error, info};
use tokio::{net::TcpListener, select, sync::Notify};

use crate::{
    config::Config,
    engine::{Engine, MemoryEngine},
    error::Error,
    network::ClientEventLoop,
    protocol::Services,
    Hook, HookNoop,
};

/// 代表一个 mqtt 服务端
pub struct Broker<E: Engine = MemoryEngine, H: Hook = HookNoop> {
    services: Services<E, H>,
    shutdown: Arc<Notify>,
}

impl Broker {
    /// 使用内存引擎，不做认证
    pub fn new(cfg: Config) -> Self {
        Self::with_engine(cfg, Arc::new(MemoryEngine::new()), Arc::new(HookNoop))
    }
}

impl<E: Engine, H: Hook> Broker<E, H> {
    pub fn with_engine(cfg: Config, engine: Arc<E>, hook: Arc<H>) -> Self {
        Self {
            services: Services::new(cfg, engine, hook),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn services(&self) -> &Services<E, H> {
        &self.services
    }

    /// 监听客户端连接，直到 [`Broker::shutdown`] 被调用
    pub async fn start(&self) -> Result<(), Error> {
        let config = &self.services.config;
        let listener = TcpListener::bind(&config.broker.client_addr).await?;
        info!("mqtt broker listening on {}", config.broker.client_addr);

        // 保活扫描
        let period = Duration::from_millis(config.mqtt.keepalive_sweep_ms.max(1));
        tokio::spawn(self.services.keepalive.clone().run(period));

        loop {
            select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("accept tcp stream error: {}", e);
                            continue;
                        }
                    };
                    debug!("new stream coming in: {}", addr);

                    let event_loop = ClientEventLoop::new(stream, self.services.clone());
                    tokio::spawn(async move {
                        if let Err(e) = event_loop.start().await {
                            debug!("event loop on {} exit: {}", addr, e);
                        }
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("mqtt broker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// 停止监听，并以 ServerShuttingDown 关闭所有连接
    pub fn shutdown(&self) {
        self.services.keepalive.shutdown_all();
        self.shutdown.notify_one();
    }
}
