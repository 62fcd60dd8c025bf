use crate::module::{Module, ModuleCtx};
use tokio::time::{interval, Duration};
use tracing::info;

/// Periodically reports accrual and lock activity.
pub struct Heartbeat { period: Duration }
impl Heartbeat { pub fn new(period: Duration) -> Self { Self { period } } }

impl Module for Heartbeat {
    fn name(&self) -> &'static str { "heartbeat" }
    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut beats: u64 = 0;
            let mut tick = interval(self.period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        beats += 1;
                        let service = &ctx.service;
                        info!(
                            beats,
                            active_jobs = service.scheduler().active_jobs(),
                            locked_records = service.locks().tracked(),
                            "heartbeat"
                        );
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("heartbeat stopping at {}", beats);
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
