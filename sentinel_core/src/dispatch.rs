//! Ordered, short-circuiting walk over an action list.

use crate::action::{Action, ActionCall, ActionList, CallerArg};
use crate::entity::TableEnt;
use crate::context::Tables;
use crate::errors::{Error, Result};
use crate::event::Event;
use crate::route::{Route, RouteTable};
use crate::types::{ActionRes, RouteFlags};
use log::{debug, warn};
use metrics::counter;

/// Runs each action in `list`, head to tail, threading `results` through.
///
/// * Fails with `AlreadyStopped`, running nothing, if `results` already
///   carries [`ActionRes::STOP`].
/// * Each action's hit count is bumped before its handler runs, unless
///   `route` carries [`RouteFlags::DONT_COUNT_HITS`].
/// * A handler error aborts the walk and is returned as-is; result bits set
///   so far are kept.
/// * A handler that sets `STOP` ends the walk successfully.
pub fn dispatch(
    tables: &Tables,
    list: &ActionList,
    caller_arg: Option<CallerArg<'_>>,
    trigger_event: Option<&Event>,
    route_table: Option<&RouteTable>,
    route: Option<&Route>,
    results: &mut ActionRes,
) -> Result<()> {
    if results.contains(ActionRes::STOP) {
        return Err(Error::AlreadyStopped);
    }
    counter!("sentinel_dispatch_total").increment(1);
    let count_hits = !route.is_some_and(|r| r.flags().contains(RouteFlags::DONT_COUNT_HITS));

    for entry in list.iter() {
        let action: &Action = entry;
        if count_hits {
            action.header().count_hit();
        }
        let call = ActionCall {
            tables,
            action,
            handler_arg: action.handler_arg(),
            caller_arg,
            trigger_event,
            route_table,
            route,
        };
        #[cfg(feature = "trace")]
        log::trace!("[DISPATCH] -> {} results={:?}", action.label(), results);

        if let Err(e) = action.invoke(&call, results) {
            warn!("[DISPATCH] handler {} failed: {}", action.label(), e);
            counter!("sentinel_handler_errors_total").increment(1);
            return Err(Error::Handler(e));
        }
        if results.contains(ActionRes::STOP) {
            debug!("[DISPATCH] stopped by {}", action.label());
            counter!("sentinel_dispatch_stopped_total").increment(1);
            return Ok(());
        }
    }
    Ok(())
}
