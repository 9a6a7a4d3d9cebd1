use async_trait::async_trait;
use tracing::{debug, warn};

use quire_types::{Block, BlockKind, CompletionStatus, DateValue, FieldError, now_millis};

use super::{
    AssignmentFailure, BlockExecutor, ExecutionJob, ExecutorContext, is_valid_variable_name,
    python_string, run_assignment,
};

/// Binds a timezone-aware datetime to a Python variable.
#[derive(Debug, Default)]
pub struct DateInputExecutor;

#[async_trait]
impl BlockExecutor for DateInputExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::DateInput
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(date) = block.date_input() else {
            return CompletionStatus::Error;
        };
        let variable = date.variable.new_value.clone();
        let name = variable.trim().to_string();
        let value = date.new_value.clone();

        let invalid = if !is_valid_variable_name(&name) {
            Some(FieldError::InvalidVariableName)
        } else if !value.is_valid() {
            Some(FieldError::InvalidDate)
        } else {
            None
        };
        if let Some(error) = invalid {
            debug!(block_id = %job.block_id, error = error.as_str(), "date input rejected");
            ctx.update_block(&job.block_id, |b| {
                if let Some(d) = b.date_input_mut() {
                    d.error = Some(error);
                }
            });
            return CompletionStatus::Error;
        }

        let watch = ctx.watch_abort(job);
        if watch.is_aborted() {
            return CompletionStatus::Aborted;
        }
        match run_assignment(ctx, assignment(&name, &value), watch.token()).await {
            Ok(()) => {
                let now = now_millis();
                ctx.update_block(&job.block_id, |b| {
                    if let Some(d) = b.date_input_mut() {
                        d.variable.commit_as(variable);
                        d.value = value;
                        d.error = None;
                        d.executed_at = Some(now);
                    }
                });
                CompletionStatus::Success
            }
            Err(failure) => {
                if !matches!(failure, AssignmentFailure::Aborted) {
                    warn!(block_id = %job.block_id, ?failure, "failed to save date input");
                    ctx.update_block(&job.block_id, |b| {
                        if let Some(d) = b.date_input_mut() {
                            d.error = Some(FieldError::Unexpected);
                        }
                    });
                }
                failure.status()
            }
        }
    }
}

fn assignment(variable: &str, value: &DateValue) -> String {
    format!(
        "import pytz\nfrom datetime import datetime\n{variable} = pytz.timezone({tz}).localize(datetime({y}, {mo}, {d}, {h}, {mi}, {s}))",
        tz = python_string(&value.timezone),
        y = value.year,
        mo = value.month,
        d = value.day,
        h = value.hours,
        mi = value.minutes,
        s = value.seconds,
    )
}
