use crate::{context::Context, errors::ErrorCode};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Process-wide registry of contexts handed out over the C ABI.
struct HandleRegistry {
    handles: DashMap<HandleId, Arc<Context>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1), // 0 is reserved for null/invalid
        }
    }

    fn register(&self, ctx: Context) -> HandleId {
        let handle_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(handle_id, Arc::new(ctx));
        handle_id
    }

    fn get(&self, handle_id: HandleId) -> Result<Arc<Context>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .get(&handle_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<Arc<Context>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .remove(&handle_id)
            .map(|(_, ctx)| ctx)
            .ok_or(ErrorCode::InvalidHandle)
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

fn get_registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

pub fn register_handle(ctx: Context) -> HandleId {
    get_registry().register(ctx)
}

/// Runs `f` against the context behind `handle_id`. The registry lock is not
/// held while `f` runs, so `f` may itself look up handles.
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&Context) -> T,
{
    let ctx = get_registry().get(handle_id)?;
    Ok(f(&ctx))
}

/// Removes the handle. The context is torn down once the last in-flight
/// call on it returns.
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    get_registry().unregister(handle_id).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let registry = HandleRegistry::new();
        assert_eq!(registry.get(0).err(), Some(ErrorCode::InvalidHandle));
        assert!(registry.unregister(999).is_err());

        let id = registry.register(Context::new().unwrap());
        assert!(registry.get(id).is_ok());
        assert!(registry.unregister(id).is_ok());
        assert_eq!(registry.get(id).err(), Some(ErrorCode::InvalidHandle));
    }
}
