//! The Pipeline Executor and Approval Gate (spec.md §4.6, §4.8): the state
//! machine driving a Request from New through Complete/Failed/Cancelled,
//! plus the handlers registered against the Job Queue for every
//! `pipeline:*` and `tv:*` job type.

pub mod approval;
pub mod executor;

pub use approval::ApprovalGate;
pub use executor::{
    DeliverHandler, DownloadHandler, EncodeHandler, ExecuteStepHandler, PipelineExecutor,
    RetryAwaitingHandler, SearchHandler, TvCheckNewEpisodesHandler, TvDownloadEpisodeHandler,
    TvDownloadSeasonHandler, TvSearchHandler,
};
