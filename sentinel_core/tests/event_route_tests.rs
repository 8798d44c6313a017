use sentinel_core::{
    handler, ActionRes, Context, Entity, Error, EventConfig, ObjectType, RefDrop, RouteFlags, RouteSpec,
    RouteTableKind, SubEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn spec(port: u16) -> RouteSpec {
    RouteSpec::from_nets("203.0.113.0/24".parse().unwrap(), "10.0.0.1/32".parse().unwrap(), 17)
        .unwrap()
        .with_ports(0, port)
}

#[test]
fn subevent_child_cannot_be_deleted() {
    let ctx = Context::new().unwrap();
    ctx.event_insert("parent", 0, None).unwrap();
    let child_id = ctx.event_insert("child", 1, None).unwrap();
    ctx.event_set_subevent("parent", SubEvent::Match, "child").unwrap();

    assert_eq!(ctx.event_get_subevent("parent", SubEvent::Match).unwrap().id(), child_id);
    assert!(matches!(
        ctx.event_get_subevent("parent", SubEvent::Insert),
        Err(Error::ItemNotFound)
    ));
    assert_eq!(ctx.event_delete("child"), Err(Error::Busy));
    assert_eq!(ctx.delete_by_id(child_id), Err(Error::Busy));

    ctx.event_clear_subevent("parent", SubEvent::Match).unwrap();
    assert_eq!(ctx.event_delete("child"), Ok(RefDrop::Released));
}

#[test]
fn parent_may_be_deleted_before_child() {
    let ctx = Context::new().unwrap();
    ctx.event_insert("parent", 0, None).unwrap();
    ctx.event_insert("child", 0, None).unwrap();
    for which in SubEvent::ALL {
        ctx.event_set_subevent("parent", which, "child").unwrap();
    }
    assert_eq!(ctx.event_delete("parent"), Ok(RefDrop::Released));
    assert_eq!(ctx.event_delete("child"), Ok(RefDrop::Released));
}

#[test]
fn ids_resolve_across_kinds() {
    let ctx = Context::new().unwrap();
    let a = ctx.action_insert("log", handler(|_, _| Ok(())), None).unwrap();
    let e = ctx.event_insert("ev", 0, None).unwrap();
    let r = ctx.route_insert(RouteTableKind::Dynamic, &spec(53), Some("ev")).unwrap();
    assert!(a != e && e != r && a != r);

    let kinds: Vec<ObjectType> = [a, e, r]
        .iter()
        .map(|id| ctx.get_by_id(*id).unwrap().kind())
        .collect();
    assert_eq!(kinds, vec![ObjectType::Action, ObjectType::Event, ObjectType::Route]);

    match ctx.get_by_id(e).unwrap() {
        Entity::Event(ev) => assert_eq!(ev.label().to_string(), "ev"),
        _ => panic!("id {e} is not an event"),
    }

    assert_eq!(ctx.delete_by_id(r), Ok(RefDrop::Released));
    assert_eq!(ctx.route_count(RouteTableKind::Dynamic), 0);
    assert_eq!(ctx.delete_by_id(a), Ok(RefDrop::Released));
    assert!(matches!(ctx.get_by_id(a), Err(Error::ItemNotFound)));
    assert_eq!(ctx.tables().by_id().len(), 1);
}

#[test]
fn hitcount_by_id() {
    let ctx = Context::new().unwrap();
    let id = ctx.action_insert("log", handler(|_, _| Ok(())), None).unwrap();
    ctx.event_insert("ev", 0, None).unwrap();
    ctx.event_action_append("ev", "log").unwrap();
    for _ in 0..3 {
        let mut res = ActionRes::empty();
        ctx.event_dispatch("ev", None, None, None, &mut res).unwrap();
    }
    assert_eq!(ctx.hitcount(id), Ok(3));
}

#[test]
fn route_insert_get_delete() {
    let ctx = Context::new().unwrap();
    ctx.event_insert("ev", 0, None).unwrap();
    let s = spec(53);
    ctx.route_insert(RouteTableKind::Static, &s, Some("ev")).unwrap();
    assert_eq!(
        ctx.route_insert(RouteTableKind::Static, &s, None),
        Err(Error::ItemAlreadyPresent)
    );
    // Tables are independent.
    ctx.route_insert(RouteTableKind::Dynamic, &s, None).unwrap();
    assert!(matches!(
        ctx.route_insert(RouteTableKind::Static, &spec(54), Some("missing")),
        Err(Error::ItemNotFound)
    ));

    let route = ctx.route_get_reference(RouteTableKind::Static, &s).unwrap();
    assert!(route.flags().contains(RouteFlags::IN_TABLE));
    assert_eq!(route.parent_event_id(), Some(ctx.event_get_reference("ev").unwrap().id()));

    assert_eq!(
        ctx.route_delete(RouteTableKind::Static, &s),
        Ok(RefDrop::Retained { refcount: 1 })
    );
    assert!(!route.flags().contains(RouteFlags::IN_TABLE));
    assert_eq!(ctx.route_drop_reference(route), RefDrop::Released);
    assert_eq!(ctx.route_count(RouteTableKind::Static), 0);
    assert_eq!(ctx.route_count(RouteTableKind::Dynamic), 1);
}

#[test]
fn state_flags_change_but_key_flags_do_not() {
    let ctx = Context::new().unwrap();
    let s = spec(53).with_flags(RouteFlags::DIRECTION_IN);
    ctx.route_insert(RouteTableKind::Dynamic, &s, None).unwrap();
    let route = ctx.route_get_reference(RouteTableKind::Dynamic, &s).unwrap();
    let (_, post) = route
        .update_flags(RouteFlags::PENALTYBOXED, RouteFlags::empty())
        .unwrap();
    assert!(post.contains(RouteFlags::PENALTYBOXED | RouteFlags::DIRECTION_IN));
    assert!(route
        .update_flags(RouteFlags::empty(), RouteFlags::DIRECTION_IN)
        .is_err());
    // A different direction is a different key.
    let other = spec(53).with_flags(RouteFlags::DIRECTION_OUT);
    assert!(ctx.route_get_reference(RouteTableKind::Dynamic, &other).is_err());
}

#[test]
fn private_data_follows_parent_config() {
    let ctx = Context::new().unwrap();
    let cfg = EventConfig {
        route_private_data_size: 10,
        route_private_data_alignment: 8,
        max_connection_count: 2,
        ..Default::default()
    };
    ctx.event_insert("sized", 0, Some(cfg)).unwrap();
    ctx.route_insert(RouteTableKind::Static, &spec(80), Some("sized")).unwrap();
    ctx.route_insert(RouteTableKind::Static, &spec(81), None).unwrap();

    let sized = ctx.route_get_reference(RouteTableKind::Static, &spec(80)).unwrap();
    assert_eq!(sized.private_data_len(), 16);
    sized.with_private_data(|d| d[0] = 0xAB);
    assert_eq!(sized.with_private_data(|d| d[0]), 0xAB);

    let meta = sized.meta();
    let max = sized.config().config.max_connection_count;
    assert_eq!(meta.add_connection(max), Ok(1));
    assert_eq!(meta.add_connection(max), Ok(2));
    assert_eq!(meta.add_connection(max), Err(Error::Busy));
    assert_eq!(meta.remove_connection(), 1);

    let plain = ctx.route_get_reference(RouteTableKind::Static, &spec(81)).unwrap();
    assert_eq!(plain.private_data_len(), ctx.config().config.route_private_data_size);
}

#[test]
fn private_data_starts_on_the_configured_alignment() {
    let ctx = Context::new().unwrap();
    let cfg = EventConfig {
        route_private_data_size: 24,
        route_private_data_alignment: 64,
        ..Default::default()
    };
    ctx.event_insert("wide", 0, Some(cfg)).unwrap();
    for port in 90..94 {
        ctx.route_insert(RouteTableKind::Dynamic, &spec(port), Some("wide")).unwrap();
        let route = ctx.route_get_reference(RouteTableKind::Dynamic, &spec(port)).unwrap();
        assert_eq!(route.private_data_len(), 64);
        assert_eq!(route.with_private_data(|d| d.as_ptr() as usize % 64), 0);
        assert!(route.with_private_data(|d| d.iter().all(|b| *b == 0)));
    }
}

#[test]
fn teardown_releases_everything() {
    let released = Arc::new(AtomicUsize::new(0));
    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    {
        let ctx = Context::new().unwrap();
        ctx.action_insert(
            "a",
            handler(|_, _| Ok(())),
            Some(Arc::new(DropCounter(Arc::clone(&released)))),
        )
        .unwrap();
        ctx.event_insert("ev", 0, None).unwrap();
        ctx.event_action_append("ev", "a").unwrap();
        ctx.route_table_default_event_set(RouteTableKind::Dynamic, "ev").unwrap();
        ctx.route_insert(RouteTableKind::Dynamic, &spec(1), Some("ev")).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn default_event_holds_a_reference() {
    let ctx = Context::new().unwrap();
    ctx.event_insert("ev", 0, None).unwrap();
    ctx.route_table_default_event_set(RouteTableKind::Static, "ev").unwrap();
    // The table's reference keeps the event alive past its deletion.
    assert_eq!(ctx.event_delete("ev"), Ok(RefDrop::Retained { refcount: 1 }));
    assert!(ctx.event_get_reference("ev").is_err());
    ctx.route_table_default_event_clear(RouteTableKind::Static).unwrap();
    assert_eq!(
        ctx.route_table_default_event_clear(RouteTableKind::Static),
        Err(Error::ItemNotFound)
    );
}
