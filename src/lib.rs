mod backend;
mod config;
mod constants;
mod csi;
mod errors;
mod lifecycle;
mod lock;
mod metrics;
mod node;
mod reconciler;
mod record;
pub mod utils;

pub use backend::*;
pub use config::*;
pub use csi::*;
pub use errors::*;
pub use lifecycle::*;
pub use lock::*;
pub use metrics::*;
pub use node::*;
pub use reconciler::*;
pub use record::*;

//-----------------------------------------------------------
// Test utils
// Shared by unit tests and the integration suite

#[doc(hidden)]
pub mod test_utils;
//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms100, ObjectivePercentile::P99);
