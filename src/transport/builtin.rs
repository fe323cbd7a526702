use super::{ConnectionAdapter, Transport, TransportJob, TransportKind};
use crate::builtin;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

/// 在当前进程内执行内置操作
pub struct BuiltinTransport;

#[async_trait]
impl Transport for BuiltinTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Builtin
    }

    async fn start(&self, job: TransportJob) -> Result<ConnectionAdapter> {
        let (events, adapter) = ConnectionAdapter::channel(TransportKind::Builtin);
        let task = tokio::spawn(async move {
            let marker = job.operation.operation.clone().unwrap_or_default();
            debug!("builtinSelector asked: {} on {}", marker, job.host.user_input);
            match builtin::dispatch(&marker, &job, &events).await {
                Ok(()) => events.end(None),
                Err(e) => events.end(Some(format!("builtin operation exiting with: {}", e))),
            }
        });
        Ok(adapter.with_task(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecOptions, RunFlags};
    use crate::context::RunContext;
    use crate::log::RunLogger;
    use crate::transport::ConnectionEvent;
    use crate::types::{BuiltinValue, Host, Operation, ShellDescription, ShellOutput};
    use crate::ui::ScriptedPrompt;
    use std::sync::Arc;

    fn job(operation: Operation, ctx: RunContext) -> TransportJob {
        TransportJob {
            shell: ShellDescription::default(),
            host: Host::new("h1", "127.0.0.1:22"),
            operation,
            options: Arc::new(ExecOptions::default()),
            ctx: Arc::new(ctx),
        }
    }

    async fn collect(mut adapter: ConnectionAdapter) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = adapter.next_event().await {
            let end = matches!(event, ConnectionEvent::End(_));
            events.push(event);
            if end {
                break;
            }
        }
        events
    }

    fn ctx() -> RunContext {
        RunContext::new(RunFlags::silent(), RunLogger::disabled())
    }

    #[tokio::test]
    async fn test_cidr_builtin_success() {
        let operation = Operation::builtin("net", "#isPrivateCidrNetwork", vec!["$NET".into()])
            .with_env("NET", "192.168.10.0/24");
        let adapter = BuiltinTransport.start(job(operation, ctx())).await.unwrap();
        assert_eq!(
            collect(adapter).await,
            vec![
                ConnectionEvent::Data(ShellOutput::stdout(
                    "[INFO] The network provided: 192.168.10.0/24 is in CIDR format and private"
                )),
                ConnectionEvent::End(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_cidr_builtin_rejects_value_count() {
        let values: Vec<BuiltinValue> = vec!["10.0.0.0/8".into(), "10.1.0.0/16".into()];
        let operation = Operation::builtin("net", "#isCidrNetwork", values);
        let adapter = BuiltinTransport.start(job(operation, ctx())).await.unwrap();
        let events = collect(adapter).await;
        let Some(ConnectionEvent::End(Some(error))) = events.last() else {
            panic!("expected an error end, got {:?}", events);
        };
        assert!(error.contains("At least one and only one value must be provided"));
    }

    #[tokio::test]
    async fn test_unknown_builtin() {
        let operation = Operation::builtin("x", "#nope", vec![]);
        let adapter = BuiltinTransport.start(job(operation, ctx())).await.unwrap();
        let events = collect(adapter).await;
        assert_eq!(
            events,
            vec![ConnectionEvent::End(Some(
                "builtin operation exiting with: Builtin operation failed: This builtin operation doesn't exist: #nope"
                    .to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn test_confirm_declined_marks_run_canceled() {
        let context = ctx().with_prompt(Arc::new(ScriptedPrompt::new(&["n"])));
        let job = job(Operation::builtin("c", "#confirm", vec![]), context);
        let ctx = job.ctx.clone();
        let adapter = BuiltinTransport.start(job).await.unwrap();
        let events = collect(adapter).await;
        assert_eq!(
            events.first(),
            Some(&ConnectionEvent::Data(ShellOutput::stdout(
                "[Builtin Confirm] Host: 127.0.0.1:22"
            )))
        );
        assert!(matches!(events.last(), Some(ConnectionEvent::End(Some(_)))));
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn test_confirm_accepted() {
        let context = ctx().with_prompt(Arc::new(ScriptedPrompt::new(&["Y"])));
        let job = job(Operation::builtin("c", "#confirm", vec![]), context);
        let ctx = job.ctx.clone();
        let events = collect(BuiltinTransport.start(job).await.unwrap()).await;
        assert_eq!(events.last(), Some(&ConnectionEvent::End(None)));
        assert!(!ctx.is_canceled());
    }
}
