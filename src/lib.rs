pub mod bus;
pub mod config;
pub mod error;
pub mod fsm;
pub mod install;
pub mod join;
pub mod logging;
pub mod ops;
pub mod plan;
pub mod rpc;

pub use bus::{Event, EventSender};
pub use config::{InstallerConfig, PeerConfig};
pub use error::{Error, Result};
pub use fsm::registry::{PhaseContext, PhaseExecutor, PhaseRegistry};
pub use fsm::{Fsm, FsmConfig};
pub use install::Installer;
pub use join::Peer;
pub use ops::operator::{LocalOperator, Operator};
pub use plan::builder::{build_plan, PlanBuilder};
pub use plan::{OperationPlan, Phase, PhaseState, PhaseStatus};
