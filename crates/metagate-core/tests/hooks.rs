//! Hook dispatch through the engine.

mod common;

use std::sync::Arc;

use common::{record, TestContext};
use metagate_core::engine::Operation;
use metagate_core::hooks::{hook_fn, HookError, HookEvent, HookFlow, HookRegistration, ObjectPattern};
use metagate_core::security::{AuditEventType, CallerContext};
use metagate_core::{Error, Outcome};
use metagate_proto::QueryAst;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

type Trace = Arc<Mutex<Vec<String>>>;

fn recorder(trace: &Trace, name: &str) -> Arc<dyn metagate_core::hooks::HookHandler> {
    let trace = trace.clone();
    let name = name.to_string();
    hook_fn(move |ctx| {
        trace.lock().push(format!("{}@{}", name, ctx.event));
        Ok(HookFlow::Continue)
    })
}

fn admin() -> CallerContext {
    CallerContext::new("root").with_role("admin")
}

async fn find(ctx: &TestContext, caller: &CallerContext) -> metagate_core::Result<Outcome> {
    ctx.engine
        .execute("admin", "invoice", Operation::Find, QueryAst::new(), caller)
        .await
}

#[tokio::test]
async fn test_execution_order_independent_of_registration_order() {
    let specs: Vec<(&str, &str, &str, i32)> = vec![
        ("audit", "before:*", "*", 100),
        ("stamp", "before:find", "invoice", 0),
        ("quota", "before:find", "inv*", 0),
        ("tenant", "*:find", "invoice", -10),
        ("metrics", "after:*", "*", 0),
        ("notify", "after:find", "invoice", 5),
        ("cleanup", "after:find", "*ice", 5),
    ];

    let mut sequences = Vec::new();
    for seed in 0..8u64 {
        let mut order = specs.clone();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let ctx = TestContext::new();
        let trace: Trace = Arc::default();
        for (name, event, object, priority) in order {
            let hook = HookRegistration::parse(name, "ops", event, object, recorder(&trace, name))
                .unwrap()
                .with_priority(priority);
            ctx.engine.register_hook(hook).unwrap();
        }

        find(&ctx, &admin()).await.unwrap();
        let sequence = trace.lock().clone();
        sequences.push(sequence);
    }

    let expected: Vec<String> = [
        "tenant@before:find",
        "quota@before:find",
        "stamp@before:find",
        "audit@before:find",
        "tenant@after:find",
        "metrics@after:find",
        "cleanup@after:find",
        "notify@after:find",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    for sequence in sequences {
        assert_eq!(sequence, expected);
    }
}

#[tokio::test]
async fn test_before_hook_rejection_prevents_dispatch() {
    let ctx = TestContext::new();
    let trace: Trace = Arc::default();

    ctx.engine
        .register_hook(HookRegistration::new(
            "freeze",
            "ops",
            HookEvent::before(metagate_core::hooks::HookAction::Delete),
            ObjectPattern::parse("invoice").unwrap(),
            hook_fn(|_| Err(HookError::Rejected("ledger is frozen".into()))),
        ))
        .unwrap();
    ctx.engine
        .register_hook(
            HookRegistration::parse("late", "ops", "before:delete", "invoice", recorder(&trace, "late"))
                .unwrap()
                .with_priority(10),
        )
        .unwrap();

    let err = ctx
        .engine
        .execute("admin", "invoice", Operation::Delete, QueryAst::new(), &admin())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::OperationAborted(ref msg) if msg.contains("ledger is frozen")));
    assert_eq!(ctx.adapter.dispatched(), 0);
    assert_eq!(ctx.adapter.rows("invoice").len(), 4);
    // later tiers never run once a tier has failed
    assert!(trace.lock().is_empty());
}

#[tokio::test]
async fn test_panicking_before_hook_aborts() {
    let ctx = TestContext::new();
    ctx.engine
        .register_hook(
            HookRegistration::parse(
                "broken",
                "ops",
                "before:create",
                "*",
                hook_fn(|_| panic!("hook bug")),
            )
            .unwrap(),
        )
        .unwrap();

    let err = ctx
        .engine
        .execute(
            "admin",
            "invoice",
            Operation::Create(record(vec![("id", "i-5".into()), ("owner_id", "root".into())])),
            QueryAst::new(),
            &admin(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OperationAborted(_)));
    assert_eq!(ctx.adapter.dispatched(), 0);
}

#[tokio::test]
async fn test_after_hook_failure_is_not_fatal() {
    let ctx = TestContext::new();
    let trace: Trace = Arc::default();

    ctx.engine
        .register_hook(
            HookRegistration::parse(
                "sync-search",
                "search",
                "after:find",
                "invoice",
                hook_fn(|_| Err(HookError::Failed("index offline".into()))),
            )
            .unwrap(),
        )
        .unwrap();
    ctx.engine
        .register_hook(
            HookRegistration::parse("log", "ops", "after:find", "invoice", recorder(&trace, "log"))
                .unwrap()
                .with_priority(1),
        )
        .unwrap();

    let outcome = find(&ctx, &admin()).await.unwrap();
    assert_eq!(outcome.rows().map(<[_]>::len), Some(4));

    // the failure is reported and later tiers still run
    assert_eq!(*trace.lock(), vec!["log@after:find".to_string()]);
    assert!(ctx.audit.events().iter().any(|e| matches!(
        &e.event_type,
        AuditEventType::HookFailed { hook, .. } if hook == "sync-search"
    )));
}

#[tokio::test]
async fn test_stop_skips_lower_priority_hooks() {
    let ctx = TestContext::new();
    let trace: Trace = Arc::default();

    ctx.engine
        .register_hook(
            HookRegistration::parse(
                "short-circuit",
                "ops",
                "before:find",
                "invoice",
                hook_fn(|_| Ok(HookFlow::Stop)),
            )
            .unwrap(),
        )
        .unwrap();
    ctx.engine
        .register_hook(
            HookRegistration::parse("skipped", "ops", "before:find", "invoice", recorder(&trace, "skipped"))
                .unwrap()
                .with_priority(5),
        )
        .unwrap();

    let outcome = find(&ctx, &admin()).await.unwrap();
    assert_eq!(outcome.rows().map(<[_]>::len), Some(4));
    assert!(trace.lock().is_empty());
}

#[tokio::test]
async fn test_cancel_during_before_hooks() {
    let ctx = TestContext::new();
    ctx.engine
        .register_hook(
            HookRegistration::parse(
                "cancel",
                "ops",
                "before:delete",
                "invoice",
                hook_fn(|ctx| {
                    ctx.caller.cancel_token().cancel();
                    Ok(HookFlow::Continue)
                }),
            )
            .unwrap(),
        )
        .unwrap();

    let err = ctx
        .engine
        .execute("admin", "invoice", Operation::Delete, QueryAst::new(), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OperationCancelled));
    assert_eq!(ctx.adapter.dispatched(), 0);
    assert_eq!(ctx.adapter.rows("invoice").len(), 4);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let ctx = TestContext::new();
    let caller = admin();
    caller.cancel_token().cancel();

    let err = find(&ctx, &caller).await.unwrap_err();
    assert!(matches!(err, Error::OperationCancelled));
    assert_eq!(ctx.adapter.dispatched(), 0);
}

#[tokio::test]
async fn test_wildcard_hook_reaches_objects_registered_later() {
    let ctx = TestContext::new();
    let trace: Trace = Arc::default();
    ctx.engine
        .register_hook(
            HookRegistration::parse("sales-audit", "ops", "before:*", "sales_*", recorder(&trace, "sales-audit"))
                .unwrap(),
        )
        .unwrap();

    ctx.registry
        .register(
            metagate_core::ObjectDef::new("sales_order", "sales")
                .with_field(metagate_core::catalog::FieldDef::new(
                    "id",
                    metagate_core::catalog::FieldType::Text,
                )),
        )
        .unwrap();

    ctx.engine
        .execute("admin", "sales_order", Operation::Count, QueryAst::new(), &admin())
        .await
        .unwrap();
    ctx.engine
        .execute("admin", "invoice", Operation::Count, QueryAst::new(), &admin())
        .await
        .unwrap();

    assert_eq!(*trace.lock(), vec!["sales-audit@before:count".to_string()]);
}
