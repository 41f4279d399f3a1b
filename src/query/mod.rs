//! Read path: PDC/EPDL dedup (C7, C8), the query planner (C9), and the
//! query executor with its reducer contract (C10).

pub mod epdl;
pub mod executor;
pub mod pdc;
pub mod planner;
pub mod reducer;

pub use epdl::{Epdl, EpdlRouter, ExtentKey};
pub use executor::{OutputPoint, QueryExecutor, SourcePoint};
pub use pdc::{PageRequest, PageRequestState, Pdc};
pub use planner::{plan_query, QueryPlan, TierRetention, QUERY_PLANS_MAX};
pub use reducer::{AverageReducer, AverageReducerFactory, Reducer, ReducerFactory};
