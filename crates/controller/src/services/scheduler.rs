/// 后台周期任务
///
/// 每个任务先随机延迟启动，之后按固定间隔执行；关闭时统一取消并等待退出

use std::future::Future;
use std::time::Duration;

use common::utils::jittered_delay;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct PeriodicScheduler {
    token: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// 启动一个周期任务
    ///
    /// 上一次执行结束后再等待 period，正在执行的一轮不会被取消打断
    pub fn spawn<F, Fut>(&mut self, name: &str, period: Duration, max_jitter: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(jittered_delay(max_jitter)) => {}
            }
            debug!("后台任务 {} 已启动，间隔 {:?}", task_name, period);

            loop {
                task().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!("后台任务 {} 已停止", task_name);
        });

        self.tasks.push((name.to_string(), handle));
        info!("✅ 后台任务 {} 已注册", name);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 取消全部任务并等待退出
    pub async fn shutdown(self) {
        self.token.cancel();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (name, result) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!("后台任务 {} 异常退出: {}", name, e);
            }
        }
        info!("所有后台任务已停止");
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}
