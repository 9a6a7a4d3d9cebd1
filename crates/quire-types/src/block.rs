//! Block model: a closed sum type over the notebook's block variants.
//!
//! Each variant carries its own compile-time-checked fields. The document
//! store keeps whole [`Block`] values; executors mutate fields through the
//! typed accessors (`python_mut()`, `sql_mut()`, ...) while they hold a block.
//!
//! Three questions drive scheduling and are answered here rather than in the
//! scheduler:
//!
//! - [`Block::is_executable`]: does the block type run at all?
//! - [`Block::executed_at`]: when did it last run to completion?
//! - [`Block::is_dirty`]: has it been edited since that run?

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::BlockId;
use crate::output::{Output, SqlResult};

/// What a block *is*. Mirrors the [`BlockBody`] variants one to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum BlockKind {
    Python,
    Sql,
    RichText,
    Visualization,
    Input,
    DropdownInput,
    DateInput,
    FileUpload,
    DashboardHeader,
}

impl BlockKind {
    /// Parse from string (case-insensitive, kebab-case).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Python => "python",
            BlockKind::Sql => "sql",
            BlockKind::RichText => "rich-text",
            BlockKind::Visualization => "visualization",
            BlockKind::Input => "input",
            BlockKind::DropdownInput => "dropdown-input",
            BlockKind::DateInput => "date-input",
            BlockKind::FileUpload => "file-upload",
            BlockKind::DashboardHeader => "dashboard-header",
        }
    }

    /// Whether blocks of this kind can be placed on the execution queue.
    pub fn is_executable(&self) -> bool {
        !matches!(
            self,
            BlockKind::RichText | BlockKind::FileUpload | BlockKind::DashboardHeader
        )
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Block
// ============================================================================

/// A single notebook block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Ordering hint within a tab; `None` for blocks not yet placed.
    pub index: Option<i64>,
    pub title: String,
    pub body: BlockBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockBody {
    Python(PythonBlock),
    Sql(SqlBlock),
    RichText(RichTextBlock),
    Visualization(VisualizationBlock),
    Input(InputBlock),
    DropdownInput(DropdownInputBlock),
    DateInput(DateInputBlock),
    FileUpload(FileUploadBlock),
    DashboardHeader,
}

impl Block {
    pub fn new(id: impl Into<BlockId>, body: BlockBody) -> Self {
        Self {
            id: id.into(),
            index: None,
            title: String::new(),
            body,
        }
    }

    pub fn new_python(id: impl Into<BlockId>, source: impl Into<String>) -> Self {
        Self::new(id, BlockBody::Python(PythonBlock::new(source)))
    }

    pub fn new_sql(
        id: impl Into<BlockId>,
        source: impl Into<String>,
        data_source_id: impl Into<String>,
        dataframe_name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            BlockBody::Sql(SqlBlock::new(source, data_source_id, dataframe_name)),
        )
    }

    pub fn new_input(
        id: impl Into<BlockId>,
        variable: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(id, BlockBody::Input(InputBlock::new(variable, value)))
    }

    pub fn new_rich_text(id: impl Into<BlockId>, content: impl Into<String>) -> Self {
        Self::new(
            id,
            BlockBody::RichText(RichTextBlock {
                content: content.into(),
            }),
        )
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn kind(&self) -> BlockKind {
        match &self.body {
            BlockBody::Python(_) => BlockKind::Python,
            BlockBody::Sql(_) => BlockKind::Sql,
            BlockBody::RichText(_) => BlockKind::RichText,
            BlockBody::Visualization(_) => BlockKind::Visualization,
            BlockBody::Input(_) => BlockKind::Input,
            BlockBody::DropdownInput(_) => BlockKind::DropdownInput,
            BlockBody::DateInput(_) => BlockKind::DateInput,
            BlockBody::FileUpload(_) => BlockKind::FileUpload,
            BlockBody::DashboardHeader => BlockKind::DashboardHeader,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.kind().is_executable()
    }

    /// Timestamp (ms) of the last run that completed, if any.
    pub fn executed_at(&self) -> Option<u64> {
        match &self.body {
            BlockBody::Python(b) => b.last_query_time,
            BlockBody::Sql(b) => b.last_query_time,
            BlockBody::Visualization(b) => b.updated_at,
            BlockBody::Input(b) => b.executed_at,
            BlockBody::DropdownInput(b) => b.executed_at,
            BlockBody::DateInput(b) => b.executed_at,
            BlockBody::RichText(_) | BlockBody::FileUpload(_) | BlockBody::DashboardHeader => None,
        }
    }

    /// Has the block been edited since it last ran?
    ///
    /// Visualizations are never dirty: they re-render from the dataframe
    /// registry, so only their upstream blocks matter.
    pub fn is_dirty(&self) -> bool {
        match &self.body {
            BlockBody::Python(b) => b.last_query.as_deref() != Some(b.source.as_str()),
            BlockBody::Sql(b) => b.last_query.as_deref() != Some(b.source.as_str()),
            BlockBody::Input(b) => b.variable.is_dirty() || b.value.is_dirty(),
            BlockBody::DropdownInput(b) => b.variable.is_dirty() || b.value.is_dirty(),
            BlockBody::DateInput(b) => b.variable.is_dirty() || b.value != b.new_value,
            BlockBody::Visualization(_)
            | BlockBody::RichText(_)
            | BlockBody::FileUpload(_)
            | BlockBody::DashboardHeader => false,
        }
    }

    /// The code this block would run, for code-bearing blocks.
    pub fn source(&self) -> Option<&str> {
        match &self.body {
            BlockBody::Python(b) => Some(&b.source),
            BlockBody::Sql(b) => Some(&b.source),
            _ => None,
        }
    }

    pub fn python(&self) -> Option<&PythonBlock> {
        match &self.body {
            BlockBody::Python(b) => Some(b),
            _ => None,
        }
    }

    pub fn python_mut(&mut self) -> Option<&mut PythonBlock> {
        match &mut self.body {
            BlockBody::Python(b) => Some(b),
            _ => None,
        }
    }

    pub fn sql(&self) -> Option<&SqlBlock> {
        match &self.body {
            BlockBody::Sql(b) => Some(b),
            _ => None,
        }
    }

    pub fn sql_mut(&mut self) -> Option<&mut SqlBlock> {
        match &mut self.body {
            BlockBody::Sql(b) => Some(b),
            _ => None,
        }
    }

    pub fn visualization(&self) -> Option<&VisualizationBlock> {
        match &self.body {
            BlockBody::Visualization(b) => Some(b),
            _ => None,
        }
    }

    pub fn visualization_mut(&mut self) -> Option<&mut VisualizationBlock> {
        match &mut self.body {
            BlockBody::Visualization(b) => Some(b),
            _ => None,
        }
    }

    pub fn input(&self) -> Option<&InputBlock> {
        match &self.body {
            BlockBody::Input(b) => Some(b),
            _ => None,
        }
    }

    pub fn input_mut(&mut self) -> Option<&mut InputBlock> {
        match &mut self.body {
            BlockBody::Input(b) => Some(b),
            _ => None,
        }
    }

    pub fn dropdown_input(&self) -> Option<&DropdownInputBlock> {
        match &self.body {
            BlockBody::DropdownInput(b) => Some(b),
            _ => None,
        }
    }

    pub fn dropdown_input_mut(&mut self) -> Option<&mut DropdownInputBlock> {
        match &mut self.body {
            BlockBody::DropdownInput(b) => Some(b),
            _ => None,
        }
    }

    pub fn date_input(&self) -> Option<&DateInputBlock> {
        match &self.body {
            BlockBody::DateInput(b) => Some(b),
            _ => None,
        }
    }

    pub fn date_input_mut(&mut self) -> Option<&mut DateInputBlock> {
        match &mut self.body {
            BlockBody::DateInput(b) => Some(b),
            _ => None,
        }
    }
}

// ============================================================================
// Editable fields
// ============================================================================

/// Why an editable field could not be committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldError {
    InvalidVariableName,
    InvalidValue,
    InvalidDate,
    Unexpected,
}

impl FieldError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldError::InvalidVariableName => "invalid-variable-name",
            FieldError::InvalidValue => "invalid-value",
            FieldError::InvalidDate => "invalid-date",
            FieldError::Unexpected => "unexpected",
        }
    }
}

/// A committed value plus the pending edit a user typed but has not run yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditableField {
    pub value: String,
    pub new_value: String,
    pub error: Option<FieldError>,
}

impl EditableField {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            new_value: value.clone(),
            value,
            error: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.value != self.new_value
    }

    /// Stage an edit without running it.
    pub fn edit(&mut self, new_value: impl Into<String>) {
        self.new_value = new_value.into();
    }

    /// Promote the pending edit to the committed value and clear any error.
    pub fn commit(&mut self) {
        self.value = self.new_value.clone();
        self.error = None;
    }

    /// Commit `value`, the edit that was actually applied. A newer pending
    /// edit stays pending.
    pub fn commit_as(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.error = None;
    }
}

// ============================================================================
// Variants
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PythonBlock {
    pub source: String,
    pub result: Vec<Output>,
    /// Source text of the last completed run.
    pub last_query: Option<String>,
    pub last_query_time: Option<u64>,
    pub start_query_time: Option<u64>,
    pub ai_suggestions: Option<String>,
    pub edit_with_ai_prompt: Option<String>,
}

impl PythonBlock {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// First error record in the current result.
    pub fn error_output(&self) -> Option<&Output> {
        self.result.iter().find(|o| o.is_error())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlBlock {
    pub source: String,
    pub data_source_id: Option<String>,
    pub is_file_data_source: bool,
    pub dataframe_name: EditableField,
    pub result: Option<SqlResult>,
    pub last_query: Option<String>,
    pub last_query_time: Option<u64>,
    pub start_query_time: Option<u64>,
    pub ai_suggestions: Option<String>,
    pub edit_with_ai_prompt: Option<String>,
}

impl SqlBlock {
    pub fn new(
        source: impl Into<String>,
        data_source_id: impl Into<String>,
        dataframe_name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            data_source_id: Some(data_source_id.into()),
            dataframe_name: EditableField::new(dataframe_name),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTextBlock {
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationBlock {
    pub dataframe_name: Option<String>,
    pub chart_type: Option<String>,
    pub x_axis: Option<String>,
    pub y_axes: Vec<String>,
    /// Rendered chart spec from the last successful run.
    pub spec: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBlock {
    pub variable: EditableField,
    pub value: EditableField,
    pub executed_at: Option<u64>,
}

impl InputBlock {
    pub fn new(variable: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            variable: EditableField::new(variable),
            value: EditableField::new(value),
            executed_at: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropdownInputBlock {
    pub variable: EditableField,
    pub value: EditableField,
    pub options: Vec<String>,
    pub executed_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateType {
    #[default]
    Date,
    DateTime,
}

/// Calendar date and wall-clock time in a named timezone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateValue {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub timezone: String,
}

impl Default for DateValue {
    fn default() -> Self {
        Self {
            year: 1970,
            month: 1,
            day: 1,
            hours: 0,
            minutes: 0,
            seconds: 0,
            timezone: "UTC".to_string(),
        }
    }
}

impl DateValue {
    /// Range-check every component. Timezone names are checked by the backend.
    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= days_in_month(self.year, self.month)
            && self.hours < 24
            && self.minutes < 60
            && self.seconds < 60
            && !self.timezone.trim().is_empty()
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        _ => 0,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateInputBlock {
    pub variable: EditableField,
    pub value: DateValue,
    pub new_value: DateValue,
    pub date_type: DateType,
    pub error: Option<FieldError>,
    pub executed_at: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadBlock {
    pub file_id: Option<String>,
    pub file_name: Option<String>,
}
