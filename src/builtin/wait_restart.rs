use super::BuiltinParameters;
use crate::error::AutomationError;
use crate::transport::EventSender;
use crate::Result;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// 探测节奏
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// 连接成功并能写入 "hello" 视为在线
async fn is_online(host: &str, port: u16, timeout: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(b"hello").await?;
        Ok::<_, std::io::Error>(())
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("checkConnection {}:{} - {}", host, port, e);
            false
        }
        Err(_) => false,
    }
}

/// 先等服务下线，再等服务重新上线
pub(super) async fn run(
    params: &BuiltinParameters,
    policy: &RestartPolicy,
    events: &EventSender,
) -> Result<()> {
    let (host, port) = (params.host.as_str(), params.port);

    events.stdout(&format!(
        "Waiting for the service: {}:{} to go offline (max: {} sec)",
        host,
        port,
        params.timeout_server_offline.as_secs()
    ));
    let started = Instant::now();
    loop {
        if !is_online(host, port, policy.connect_timeout).await {
            events.stdout(&format!(
                "Step 1: The service: {}:{} is offline [Waiting time: {} ms]",
                host,
                port,
                started.elapsed().as_millis()
            ));
            break;
        }
        tokio::time::sleep(policy.poll_interval).await;
        if started.elapsed() >= params.timeout_server_offline {
            return Err(AutomationError::BuiltinError(format!(
                "Timeout has been reached: Server: {} is always online ({} sec)",
                host,
                params.timeout_server_offline.as_secs()
            )));
        }
    }

    events.stdout(&format!(
        "Waiting for the service: {}:{} to go online (max: {} sec)",
        host,
        port,
        params.timeout_server_online.as_secs()
    ));
    let started = Instant::now();
    let offline_period = loop {
        if is_online(host, port, policy.connect_timeout).await {
            let waited = started.elapsed().as_millis();
            events.stdout(&format!(
                "Step 2: The service: {}:{} is online [Waiting time: {} ms]",
                host, port, waited
            ));
            break waited;
        }
        tokio::time::sleep(policy.poll_interval).await;
        if started.elapsed() >= params.timeout_server_online {
            return Err(AutomationError::BuiltinError(
                "Timeout has been reached: Server not reachable (offline)".to_string(),
            ));
        }
    };

    events.stdout(&format!(
        "[INFO] The service: {}:{} is online and ready to accept connections after a disconnection period: {} ms",
        host, port, offline_period
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionAdapter, ConnectionEvent, TransportKind};
    use tokio::net::TcpListener;

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            connect_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn params(port: u16, offline: u64, online: u64) -> BuiltinParameters {
        BuiltinParameters {
            host: "127.0.0.1".to_string(),
            port,
            timeout_server_offline: Duration::from_secs(offline),
            timeout_server_online: Duration::from_secs(online),
        }
    }

    async fn drain(mut adapter: ConnectionAdapter) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(ConnectionEvent::Data(out)) = adapter.next_event().await {
            lines.push(out.message);
        }
        lines
    }

    #[tokio::test]
    async fn test_service_goes_down_then_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // 服务稍后重新监听
        let relisten = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let (events, adapter) = ConnectionAdapter::channel(TransportKind::Builtin);
        run(&params(port, 5, 5), &fast_policy(), &events).await.unwrap();
        drop(events);
        let lines = drain(adapter).await;
        relisten.abort();

        assert!(lines.iter().any(|l| l.starts_with("Step 1: The service: 127.0.0.1")));
        assert!(lines.iter().any(|l| l.starts_with("Step 2: The service: 127.0.0.1")));
        assert!(lines.last().unwrap().starts_with("[INFO] The service: 127.0.0.1"));
    }

    #[tokio::test]
    async fn test_service_never_goes_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (events, _adapter) = ConnectionAdapter::channel(TransportKind::Builtin);
        let err = run(&params(port, 0, 5), &fast_policy(), &events)
            .await
            .unwrap_err();
        accept.abort();
        assert_eq!(
            err,
            AutomationError::BuiltinError(
                "Timeout has been reached: Server: 127.0.0.1 is always online (0 sec)".to_string()
            )
        );
    }
}
