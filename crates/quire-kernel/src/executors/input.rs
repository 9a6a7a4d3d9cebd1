//! Text and dropdown inputs: bind a string to a Python variable.

use async_trait::async_trait;
use tracing::{debug, warn};

use quire_types::{Block, BlockKind, CompletionStatus, EditableField, FieldError, now_millis};

use super::{
    AssignmentFailure, BlockExecutor, ExecutionJob, ExecutorContext, is_valid_variable_name,
    python_string, run_assignment,
};

#[derive(Debug, Default)]
pub struct TextInputExecutor;

#[derive(Debug, Default)]
pub struct DropdownInputExecutor;

#[async_trait]
impl BlockExecutor for TextInputExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::Input
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(input) = block.input() else {
            return CompletionStatus::Error;
        };
        save(ctx, job, &input.variable, &input.value, None).await
    }
}

#[async_trait]
impl BlockExecutor for DropdownInputExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::DropdownInput
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(dropdown) = block.dropdown_input() else {
            return CompletionStatus::Error;
        };
        save(
            ctx,
            job,
            &dropdown.variable,
            &dropdown.value,
            Some(dropdown.options.as_slice()),
        )
        .await
    }
}

fn fields_mut(block: &mut Block) -> Option<(&mut EditableField, &mut EditableField, &mut Option<u64>)> {
    match block.kind() {
        BlockKind::Input => block
            .input_mut()
            .map(|i| (&mut i.variable, &mut i.value, &mut i.executed_at)),
        BlockKind::DropdownInput => block
            .dropdown_input_mut()
            .map(|d| (&mut d.variable, &mut d.value, &mut d.executed_at)),
        _ => None,
    }
}

async fn save(
    ctx: &ExecutorContext,
    job: &ExecutionJob,
    variable: &EditableField,
    value: &EditableField,
    options: Option<&[String]>,
) -> CompletionStatus {
    let name = variable.new_value.trim().to_string();
    if !is_valid_variable_name(&name) {
        debug!(block_id = %job.block_id, variable = %name, "invalid input variable name");
        ctx.update_block(&job.block_id, |b| {
            if let Some((variable, _, _)) = fields_mut(b) {
                variable.error = Some(FieldError::InvalidVariableName);
            }
        });
        return CompletionStatus::Error;
    }
    if let Some(options) = options
        && !options.contains(&value.new_value)
    {
        debug!(block_id = %job.block_id, value = %value.new_value, "dropdown value not among options");
        ctx.update_block(&job.block_id, |b| {
            if let Some((_, value, _)) = fields_mut(b) {
                value.error = Some(FieldError::InvalidValue);
            }
        });
        return CompletionStatus::Error;
    }

    let watch = ctx.watch_abort(job);
    if watch.is_aborted() {
        return CompletionStatus::Aborted;
    }
    let code = format!("{name} = {}", python_string(&value.new_value));
    match run_assignment(ctx, code, watch.token()).await {
        Ok(()) => {
            let now = now_millis();
            ctx.update_block(&job.block_id, |b| {
                if let Some((variable_field, value_field, executed_at)) = fields_mut(b) {
                    variable_field.commit_as(variable.new_value.as_str());
                    value_field.commit_as(value.new_value.as_str());
                    *executed_at = Some(now);
                }
            });
            debug!(block_id = %job.block_id, variable = %name, "input saved");
            CompletionStatus::Success
        }
        Err(failure) => {
            if !matches!(failure, AssignmentFailure::Aborted) {
                warn!(block_id = %job.block_id, ?failure, "failed to save input");
                ctx.update_block(&job.block_id, |b| {
                    if let Some((_, value, _)) = fields_mut(b) {
                        value.error = Some(FieldError::Unexpected);
                    }
                });
            }
            failure.status()
        }
    }
}
