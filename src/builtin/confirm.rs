use super::BuiltinParameters;
use crate::error::AutomationError;
use crate::transport::{EventSender, TransportJob};
use crate::Result;
use tracing::debug;

const CONFIRM_QUESTION: &str = "Confirm to continue: Y/(N)";

/// 暂停进度提示并询问操作员，只有 "Y" 继续
pub(super) async fn run(job: &TransportJob, events: &EventSender) -> Result<()> {
    let values = job.operation.values.clone().unwrap_or_default();
    let params = BuiltinParameters::from_target(&job.host.to_perform, &values)?;
    debug!("builtinConfirm, parameters: {:?}", params);

    let ctx = job.ctx.clone();
    let header = format!("[Builtin Confirm] Host: {}:{}", params.host, params.port);
    events.stdout(&header);

    ctx.spinner.pause();
    ctx.spinner.println(&header);
    let prompt = ctx.prompt.clone();
    let answer = tokio::task::spawn_blocking(move || prompt.question(CONFIRM_QUESTION))
        .await
        .map_err(|e| AutomationError::InternalError(format!("Prompt task failed: {}", e)))?;
    ctx.spinner.resume();

    if answer?.trim() == "Y" {
        Ok(())
    } else {
        ctx.mark_canceled();
        Err(AutomationError::CanceledByUser)
    }
}
