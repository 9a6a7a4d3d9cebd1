use async_trait::async_trait;
use tracing::{debug, error};

use quire_types::{Block, BlockKind, CompletionStatus, now_millis};

use super::{BlockExecutor, ExecutionJob, ExecutorContext, Settled, settle};
use crate::backend::{ChartOutcome, ChartRequest};
use crate::error::BackendError;

/// Renders a chart from a dataframe in the registry.
#[derive(Debug, Default)]
pub struct VisualizationExecutor;

// Chart types that do not need an x axis / y series.
const NO_X_AXIS: &[&str] = &["number", "trend"];
const NO_Y_AXIS: &[&str] = &["histogram"];

#[async_trait]
impl BlockExecutor for VisualizationExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::Visualization
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(vis) = block.visualization() else {
            return CompletionStatus::Error;
        };
        let Some(dataframe) = vis.dataframe_name.clone() else {
            return CompletionStatus::Error;
        };
        let chart_type = vis.chart_type.as_deref().unwrap_or_default();
        let exists = ctx
            .notebook
            .read(|doc| doc.dataframes().get(&dataframe).is_some());
        let missing_x = vis.x_axis.is_none() && !NO_X_AXIS.contains(&chart_type);
        let missing_y = vis.y_axes.is_empty() && !NO_Y_AXIS.contains(&chart_type);
        if !exists || missing_x || missing_y {
            debug!(block_id = %job.block_id, dataframe = %dataframe, exists, missing_x, missing_y, "visualization not runnable");
            return CompletionStatus::Error;
        }

        let watch = ctx.watch_abort(job);
        let clear_spec = |ctx: &ExecutorContext, error: Option<String>| {
            ctx.update_block(&job.block_id, |b| {
                if let Some(v) = b.visualization_mut() {
                    v.spec = None;
                    if error.is_some() {
                        v.error = error;
                    }
                }
            });
        };
        if watch.is_aborted() {
            clear_spec(ctx, None);
            return CompletionStatus::Aborted;
        }

        let request = ChartRequest {
            workspace_id: ctx.notebook.workspace_id(),
            document_id: ctx.notebook.document_id(),
            dataframe,
            chart_type: vis.chart_type.clone(),
            x_axis: vis.x_axis.clone(),
            y_axes: vis.y_axes.clone(),
        };
        let call = ctx.backends.charts.render(request, watch.token().clone());
        match settle(call, watch.token(), ctx.config.abort_grace()).await {
            Settled::Aborted { .. } | Settled::Done(Err(BackendError::Cancelled)) => {
                clear_spec(ctx, None);
                CompletionStatus::Aborted
            }
            Settled::Done(Err(e)) => {
                error!(block_id = %job.block_id, error = %e, "chart rendering failed");
                clear_spec(ctx, Some(e.to_string()));
                CompletionStatus::Error
            }
            Settled::Done(Ok(ChartOutcome::Invalid(reason))) => {
                clear_spec(ctx, Some(reason));
                CompletionStatus::Error
            }
            Settled::Done(Ok(ChartOutcome::Spec(spec))) => {
                let now = now_millis();
                ctx.update_block(&job.block_id, |b| {
                    if let Some(v) = b.visualization_mut() {
                        v.spec = Some(spec);
                        v.error = None;
                        v.updated_at = Some(now);
                    }
                });
                CompletionStatus::Success
            }
        }
    }
}
