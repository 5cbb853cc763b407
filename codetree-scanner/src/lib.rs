pub mod adapter;
pub mod artifact;
pub mod error;
pub mod nexacro;
pub mod probe;
pub mod result;
pub mod scripted;
pub mod session;
pub mod tree;
pub mod walker;

pub use adapter::UiAdapter;
pub use artifact::ArtifactStore;
pub use error::ScanError;
pub use nexacro::{NexacroOptions, NexacroPortal, PortalSelectors};
pub use probe::ReachabilityProbe;
pub use result::{ArtifactRef, DownloadedFile, VisitRecord, VisitStatus};
pub use scripted::{MenuEntry, ScriptedPortal};
pub use session::{RecoveryEvent, RecoveryPolicy, SessionManager, SessionState};
pub use tree::{CategoryNode, CategoryPath, LabelParts, Level};
pub use walker::{CompletedCheck, ProgressCallback, TreeWalker, WalkerSettings};
