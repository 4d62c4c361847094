//! Order lifecycle, stage identity, and log status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three sequential pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Stage 1: numeric preprocessing of the input tables.
    Preprocessing,
    /// Stage 2: literature and database enrichment.
    RagEnrichment,
    /// Stage 3: report generation.
    ReportGeneration,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [Self; 3] = [
        Self::Preprocessing,
        Self::RagEnrichment,
        Self::ReportGeneration,
    ];

    /// The stage name as used in logs and events.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::RagEnrichment => "rag_enrichment",
            Self::ReportGeneration => "report_generation",
        }
    }

    /// The named dispatch queue for this stage.
    #[must_use]
    pub const fn queue_name(&self) -> &'static str {
        self.as_str()
    }

    /// The stage that follows this one, if any.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Preprocessing => Some(Self::RagEnrichment),
            Self::RagEnrichment => Some(Self::ReportGeneration),
            Self::ReportGeneration => None,
        }
    }

    /// The stage that precedes this one, if any.
    #[must_use]
    pub const fn previous(&self) -> Option<Self> {
        match self {
            Self::Preprocessing => None,
            Self::RagEnrichment => Some(Self::Preprocessing),
            Self::ReportGeneration => Some(Self::RagEnrichment),
        }
    }

    /// The order status while this stage is current.
    #[must_use]
    pub const fn running_status(&self) -> OrderStatus {
        match self {
            Self::Preprocessing => OrderStatus::Stage1,
            Self::RagEnrichment => OrderStatus::Stage2,
            Self::ReportGeneration => OrderStatus::Stage3,
        }
    }

    /// The first stage of the pipeline.
    #[must_use]
    pub const fn first() -> Self {
        Self::Preprocessing
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprocessing" => Ok(Self::Preprocessing),
            "rag_enrichment" => Ok(Self::RagEnrichment),
            "report_generation" => Ok(Self::ReportGeneration),
            other => Err(format!(
                "Invalid stage '{other}'. Must be one of: preprocessing, rag_enrichment, report_generation"
            )),
        }
    }
}

/// The lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, never started.
    #[default]
    Pending,
    /// A stage has been dispatched but has not started.
    Queued,
    /// Stage 1 is running.
    Stage1,
    /// Stage 2 is running.
    Stage2,
    /// Stage 3 is running.
    Stage3,
    /// All requested work finished.
    Completed,
    /// A stage failed.
    Failed,
    /// The order was stopped by a user.
    Cancelled,
}

impl OrderStatus {
    /// Statuses from which a dispatched stage may still start.
    pub const RUNNABLE: [Self; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Stage1,
        Self::Stage2,
        Self::Stage3,
        Self::Completed,
        Self::Failed,
    ];

    /// Statuses a user cancel may move out of.
    pub const CANCELLABLE: [Self; 4] = [Self::Queued, Self::Stage1, Self::Stage2, Self::Stage3];

    /// Returns true while a stage is queued or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    /// Returns true for states no worker will move out of on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a full (re)start may be requested.
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Failed | Self::Completed | Self::Cancelled
        )
    }

    /// Whether a single-stage re-run may be requested.
    #[must_use]
    pub fn can_rerun(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the order may be cancelled.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        self.is_active()
    }

    /// The stage currently running, if any.
    #[must_use]
    pub fn running_stage(&self) -> Option<StageName> {
        match self {
            Self::Stage1 => Some(StageName::Preprocessing),
            Self::Stage2 => Some(StageName::RagEnrichment),
            Self::Stage3 => Some(StageName::ReportGeneration),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Stage1 => "stage1",
            Self::Stage2 => "stage2",
            Self::Stage3 => "stage3",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status carried by a progress event and its log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// A stage or step began.
    Started,
    /// A step is in flight.
    Running,
    /// Intermediate progress.
    Progress,
    /// A stage or step finished.
    Completed,
    /// A stage failed.
    Failed,
    /// A stage stopped without running to completion.
    Skipped,
}

impl LogStatus {
    /// Returns true if this status ends a stage invocation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}
