//! 网关注册调度
//!
//! 首次在启动 5 秒后触发，之后每 (租期 - 余量) 分钟触发一次。
//! 每次触发都重新读取网关快照，所有尝试并发执行，互不影响。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RegistrationAttempt, RegistrationOutcome, RegistryHelper};
use crate::config::{GatewayTarget, RegistrationPolicy};
use crate::error::{ConfigError, RegistrationAttemptError};
use crate::resources::ResourcesApi;

/// 调度节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl RegistrationSchedule {
    /// 周期 = (租期 - 余量) 分钟，严格小于租期
    pub fn from_policy(policy: &RegistrationPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        let period_secs = (policy.lease_minutes - policy.margin_minutes)
            .checked_mul(60)
            .ok_or_else(|| ConfigError::Invalid("registration period overflows".into()))?;
        Ok(Self {
            initial_delay: policy.initial_delay,
            period: Duration::from_secs(period_secs),
        })
    }
}

/// 一次触发的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub registered: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct RegistrationScheduler {
    resources: Arc<dyn ResourcesApi>,
    helper: Arc<dyn RegistryHelper>,
    schedule: RegistrationSchedule,
    attempt_timeout: Duration,
}

impl RegistrationScheduler {
    pub fn new(
        resources: Arc<dyn ResourcesApi>,
        helper: Arc<dyn RegistryHelper>,
        policy: &RegistrationPolicy,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            resources,
            helper,
            schedule: RegistrationSchedule::from_policy(policy)?,
            attempt_timeout: policy.attempt_timeout,
        })
    }

    pub fn schedule(&self) -> RegistrationSchedule {
        self.schedule
    }

    /// 展开网关列表：有主机时注册主机，另外每个别名注册服务器各一次
    pub fn attempts_for(gateways: &[GatewayTarget]) -> Vec<RegistrationAttempt> {
        let mut attempts = Vec::new();
        for gateway in gateways {
            let hosts = gateway
                .host
                .iter()
                .chain(gateway.registries.iter().flatten());
            for host in hosts {
                attempts.push(RegistrationAttempt {
                    gateway: gateway.display_name().to_string(),
                    username: gateway.username.clone(),
                    host: host.clone(),
                    transport: gateway.transport,
                });
            }
        }
        attempts
    }

    /// 执行一次注册周期，失败只记录日志
    pub async fn run_tick(&self) -> TickReport {
        let gateways = match self.resources.gateways() {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("skipping registration tick, gateway snapshot unavailable: {}", e);
                return TickReport::default();
            }
        };

        let attempts = Self::attempts_for(&gateways);
        let mut report = TickReport {
            attempted: attempts.len(),
            ..Default::default()
        };
        let mut set = JoinSet::new();

        for attempt in attempts {
            let helper = self.helper.clone();
            let timeout = self.attempt_timeout;
            set.spawn(async move {
                debug!(
                    "Register with {} using {}@{}",
                    attempt.gateway, attempt.username, attempt.host
                );
                let result = tokio::time::timeout(
                    timeout,
                    helper.request_challenge(&attempt.username, &attempt.host, attempt.transport),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(RegistrationAttemptError::Timeout {
                        host: attempt.host.clone(),
                        after: timeout,
                    })
                });
                (attempt, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (attempt, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("registration attempt aborted: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(RegistrationOutcome::Registered { status }) => {
                    debug!(%attempt, status, "registered");
                    report.registered += 1;
                }
                Ok(RegistrationOutcome::Rejected { status }) => {
                    warn!(%attempt, status, "registration rejected, retrying next period");
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!(%attempt, "registration attempt failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// 按节奏循环触发，直到取消
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(
            Instant::now() + self.schedule.initial_delay,
            self.schedule.period,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_tick() => {
                    debug!(?report, "registration tick finished");
                }
            }
        }
        debug!("registration scheduler stopped");
    }

    /// 在独立线程（自带单线程运行时）上运行调度循环
    pub fn spawn(self) -> std::io::Result<ScheduledTask> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.schedule.period;

        let worker = tokio::task::spawn_blocking(move || {
            runtime.block_on(self.run(token));
        });
        info!(period_secs = period.as_secs(), "registration scheduler started");

        Ok(ScheduledTask {
            cancel,
            worker: Some(worker),
        })
    }
}

/// 已启动的调度任务；drop 时同样会取消
pub struct ScheduledTask {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// 取消后续触发，放弃进行中的尝试并等待线程退出
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("registration scheduler thread ended abnormally: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
