use async_trait::async_trait;
use tracing::{debug, error, warn};

use quire_types::{
    Block, BlockKind, CompletionStatus, DataFrame, ExecutionMetadata, FieldError, SqlResult,
    now_millis,
};

use super::{BlockExecutor, ExecutionJob, ExecutorContext, Settled, is_valid_variable_name, settle};
use crate::backend::QueryRequest;
use crate::error::BackendError;

/// Runs SQL blocks through the query backend and binds the result to the
/// block's dataframe name.
#[derive(Debug, Default)]
pub struct SqlExecutor;

#[async_trait]
impl BlockExecutor for SqlExecutor {
    fn kind(&self) -> BlockKind {
        BlockKind::Sql
    }

    async fn execute(&self, ctx: &ExecutorContext, job: &ExecutionJob, block: Block) -> CompletionStatus {
        let Some(sql) = block.sql() else {
            return CompletionStatus::Error;
        };
        let (is_suggestion, selected_code) = match &job.metadata {
            ExecutionMetadata::Sql {
                is_suggestion,
                selected_code,
            } => (*is_suggestion, selected_code.clone()),
            _ => (false, None),
        };

        let dataframe_name = sql.dataframe_name.value.clone();
        if !is_valid_variable_name(&dataframe_name) {
            debug!(block_id = %job.block_id, dataframe_name = %dataframe_name, "invalid dataframe name");
            ctx.update_block(&job.block_id, |b| {
                if let Some(s) = b.sql_mut() {
                    s.dataframe_name.error = Some(FieldError::InvalidVariableName);
                }
            });
            return CompletionStatus::Error;
        }
        let data_source_id = match (&sql.data_source_id, sql.is_file_data_source) {
            (Some(id), _) => id.clone(),
            (None, true) => String::new(),
            (None, false) => {
                debug!(block_id = %job.block_id, "sql block has no data source");
                return CompletionStatus::Error;
            }
        };

        let watch = ctx.watch_abort(job);
        let aborted = |ctx: &ExecutorContext| {
            ctx.update_block(&job.block_id, |b| {
                if let Some(s) = b.sql_mut() {
                    s.result = Some(SqlResult::aborted());
                }
            });
            CompletionStatus::Aborted
        };
        if watch.is_aborted() {
            return aborted(ctx);
        }

        let query = selected_code
            .filter(|code| !code.trim().is_empty())
            .unwrap_or_else(|| {
                if is_suggestion {
                    sql.ai_suggestions.clone().unwrap_or_default()
                } else {
                    sql.source.clone()
                }
            })
            .trim()
            .to_string();

        let started = now_millis();
        ctx.update_block(&job.block_id, |b| {
            if let Some(s) = b.sql_mut() {
                s.result = None;
                s.start_query_time = Some(started);
            }
        });

        if query.is_empty() {
            ctx.update_block(&job.block_id, |b| {
                if let Some(s) = b.sql_mut() {
                    s.result = Some(SqlResult::EmptyQuery);
                }
            });
            return CompletionStatus::Error;
        }

        let request = QueryRequest {
            workspace_id: ctx.notebook.workspace_id(),
            document_id: ctx.notebook.document_id(),
            data_source_id,
            is_file_data_source: sql.is_file_data_source,
            query: query.clone(),
            dataframe_name: dataframe_name.clone(),
        };
        let call = ctx.backends.queries.run_query(request, watch.token().clone());
        let result = match settle(call, watch.token(), ctx.config.abort_grace()).await {
            Settled::Aborted { .. } | Settled::Done(Err(BackendError::Cancelled)) => {
                return aborted(ctx);
            }
            Settled::Done(Err(e)) => {
                error!(block_id = %job.block_id, error = %e, "sql query failed");
                ctx.update_block(&job.block_id, |b| {
                    if let Some(s) = b.sql_mut() {
                        s.result = Some(SqlResult::PythonError {
                            ename: "QueryBackendError".to_string(),
                            evalue: e.to_string(),
                        });
                    }
                });
                return CompletionStatus::Error;
            }
            Settled::Done(Ok(SqlResult::AbortError { .. })) => return aborted(ctx),
            Settled::Done(Ok(result)) => result,
        };

        let finished = now_millis();
        let status = match &result {
            SqlResult::Success { columns, .. } => {
                ctx.notebook.update(|doc| {
                    doc.put_dataframe(DataFrame {
                        name: dataframe_name.clone(),
                        columns: columns.clone(),
                        updated_at: finished,
                        block_id: Some(job.block_id.clone()),
                    })
                });
                CompletionStatus::Success
            }
            SqlResult::SyntaxError { message } => {
                warn!(block_id = %job.block_id, error = %message, "sql syntax error");
                CompletionStatus::Error
            }
            SqlResult::PythonError { ename, evalue } => {
                error!(block_id = %job.block_id, ename = %ename, evalue = %evalue, "python error while running sql");
                CompletionStatus::Error
            }
            SqlResult::EmptyQuery | SqlResult::AbortError { .. } => CompletionStatus::Error,
        };

        ctx.update_block(&job.block_id, |b| {
            if let Some(s) = b.sql_mut() {
                s.result = Some(result);
                s.last_query = Some(query);
                s.last_query_time = Some(finished);
            }
        });
        status
    }
}
