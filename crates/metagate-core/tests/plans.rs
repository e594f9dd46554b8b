//! Plan compilation and caching as seen through the engine.

mod common;

use common::TestContext;
use metagate_core::engine::Operation;
use metagate_core::security::CallerContext;
use metagate_core::EngineConfig;
use metagate_proto::{FilterNode, Pagination, QueryAst, SortKey, Value};
use pretty_assertions::assert_eq;

fn admin() -> CallerContext {
    CallerContext::new("root").with_role("admin")
}

#[tokio::test]
async fn test_equivalent_filters_share_a_plan() {
    let ctx = TestContext::new();
    let a = FilterNode::eq("status", "open");
    let b = FilterNode::gt("total", 50.0);

    for filter in [
        FilterNode::and(vec![a.clone(), b.clone()]),
        FilterNode::and(vec![b.clone(), a.clone()]),
        FilterNode::and(vec![b.clone(), FilterNode::and(vec![a.clone(), a.clone()])]),
    ] {
        let outcome = ctx
            .engine
            .execute("admin", "invoice", Operation::Find, QueryAst::new().with_filter(filter), &admin())
            .await
            .unwrap();
        assert_eq!(outcome.rows().map(<[_]>::len), Some(2));
    }

    let plans = ctx.adapter.plans();
    assert_eq!(plans.len(), 3);
    assert!(plans.iter().all(|p| p.key == plans[0].key));
    assert_eq!(ctx.engine.queries().build_count(), 1);
    assert_eq!(ctx.engine.queries().stats().hits(), 2);
}

#[tokio::test]
async fn test_in_list_order_does_not_matter() {
    let ctx = TestContext::new();

    for values in [
        vec![Value::from("paid"), Value::from("open")],
        vec![Value::from("open"), Value::from("paid"), Value::from("open")],
    ] {
        ctx.engine
            .execute(
                "admin",
                "invoice",
                Operation::Count,
                QueryAst::new().with_filter(FilterNode::in_values("status", values)),
                &admin(),
            )
            .await
            .unwrap();
    }

    let plans = ctx.adapter.plans();
    assert_eq!(plans[0].key, plans[1].key);
}

#[tokio::test]
async fn test_different_queries_get_different_plans() {
    let ctx = TestContext::new();

    let base = QueryAst::new().with_filter(FilterNode::eq("status", "open"));
    for ast in [
        base.clone(),
        base.clone().with_sort(SortKey::desc("total")),
        base.clone().with_pagination(Pagination::limit(1)),
        QueryAst::new().with_filter(FilterNode::eq("status", "paid")),
    ] {
        ctx.engine
            .execute("admin", "invoice", Operation::Find, ast, &admin())
            .await
            .unwrap();
    }

    let mut keys: Vec<String> = ctx.adapter.plans().iter().map(|p| p.key.to_hex()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 4);
}

#[tokio::test]
async fn test_sort_and_limit_reach_adapter() {
    let ctx = TestContext::new();

    let outcome = ctx
        .engine
        .execute(
            "admin",
            "invoice",
            Operation::Find,
            QueryAst::new()
                .with_sort(SortKey::desc("total"))
                .with_pagination(Pagination::limit(2)),
            &admin(),
        )
        .await
        .unwrap();

    let ids: Vec<&Value> = outcome
        .rows()
        .unwrap()
        .iter()
        .filter_map(|r| r.get("id"))
        .collect();
    assert_eq!(ids, vec![&Value::from("i-3"), &Value::from("i-1")]);
}

#[tokio::test]
async fn test_contradiction_compiles_to_empty_plan() {
    let ctx = TestContext::new();

    let filter = FilterNode::and(vec![
        FilterNode::eq("status", "open"),
        FilterNode::eq("status", "paid"),
    ]);
    let outcome = ctx
        .engine
        .execute("admin", "invoice", Operation::Find, QueryAst::new().with_filter(filter), &admin())
        .await
        .unwrap();

    assert_eq!(outcome.rows().map(<[_]>::len), Some(0));
    assert!(ctx.adapter.plans()[0].is_empty_result());
}

#[tokio::test]
async fn test_owner_filter_picks_owner_index() {
    let ctx = TestContext::new();
    let viewer = CallerContext::new("U1").with_role("viewer");

    ctx.engine
        .execute("viewer", "invoice", Operation::Find, QueryAst::new(), &viewer)
        .await
        .unwrap();

    let plan = &ctx.adapter.plans()[0];
    let hint = plan.preferred_index().unwrap();
    assert_eq!(hint.index, "by_owner");
    assert_eq!(hint.covered_fields, vec!["owner_id".to_string()]);
}

#[tokio::test]
async fn test_zero_capacity_disables_plan_cache() {
    let ctx = TestContext::with_config(EngineConfig::new().with_plan_cache_capacity(0));

    for _ in 0..3 {
        ctx.engine
            .execute("admin", "invoice", Operation::Count, QueryAst::new(), &admin())
            .await
            .unwrap();
    }
    assert_eq!(ctx.engine.queries().build_count(), 3);
    assert!(ctx.engine.queries().cache().is_empty());
}

#[tokio::test]
async fn test_filter_depth_limit() {
    let ctx = TestContext::with_config(EngineConfig::new().with_max_filter_depth(3));

    let mut filter = FilterNode::eq("status", "open");
    for _ in 0..4 {
        filter = FilterNode::not(FilterNode::not(filter));
    }
    let err = ctx
        .engine
        .execute("admin", "invoice", Operation::Find, QueryAst::new().with_filter(filter), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, metagate_core::Error::InvalidQuery(_)));
}
