//! End-to-end retrieval scenarios against small fixture repositories
//! inserted through the store API.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use common::storage::{
    db::SqliteStore,
    types::{
        chunk::Chunk,
        file_record::FileRecord,
        reference::{EdgeKind, Reference},
        span::{NewSpan, Span, SpanKind},
    },
};
use common::utils::config::{RerankConfig, TokenizerConfig};

use retrieval_pipeline::{
    graph::{GraphExpander, SeedSpan},
    intent::Intent,
    pipeline::{AssembleRequest, PipelineConfig, RetrievalPipeline},
    reranking::RerankerBus,
};

async fn span_with_chunk(
    store: &SqliteStore,
    path: &str,
    name: &str,
    kind: SpanKind,
    signature: &str,
    content: &str,
    start: u64,
) -> Span {
    let span = Span::new(NewSpan {
        repo: "demo",
        path,
        byte_start: start,
        byte_end: start + content.len().max(1) as u64,
        kind: Some(kind),
        name: Some(name),
        signature: Some(signature),
        doc: None,
        parents: Vec::new(),
    })
    .expect("span");
    span.upsert(store).await.expect("span upsert");
    Chunk::new(&span, content.to_string())
        .upsert(store)
        .await
        .expect("chunk upsert");
    span
}

fn pipeline(store: Arc<SqliteStore>) -> RetrievalPipeline {
    let bus = RerankerBus::from_config(
        &RerankConfig {
            primary: "mock".to_string(),
            ..RerankConfig::default()
        },
        4,
        Duration::from_secs(10),
        24,
    )
    .expect("bus");
    RetrievalPipeline::new(store, PipelineConfig::default()).with_reranker_bus(Arc::new(bus))
}

/// Scenario 1: symbol query over a function plus its test, connected by a
/// test-of edge.
#[tokio::test]
async fn symbol_intent_resolves_the_definition_and_its_test() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    let definition = span_with_chunk(
        &store,
        "src/user.py",
        "get_user_by_id",
        SpanKind::Function,
        "def get_user_by_id(id):",
        "def get_user_by_id(id):\n    \"\"\"Fetch a user record.\"\"\"\n    return db.get(id)",
        0,
    )
    .await;
    let test = span_with_chunk(
        &store,
        "tests/test_user.py",
        "test_fetch_user",
        SpanKind::Function,
        "def test_fetch_user():",
        "def test_fetch_user():\n    assert fetch(1) is not None",
        0,
    )
    .await;
    Reference::bulk_insert(
        vec![Reference::new(
            &test.span_id,
            "src/user.py",
            5,
            40,
            EdgeKind::TestOf,
        )],
        &store,
    )
    .await
    .expect("edge");

    let pipeline = pipeline(Arc::clone(&store));
    let mut request = AssembleRequest::new("getUserById function");
    request.token_budget = Some(2000);
    request.repo = Some("demo".to_string());

    let bundle = pipeline.assemble(request).await.expect("assemble");

    assert_eq!(bundle.intent, Intent::Symbol);
    assert!(bundle.token_report.actual <= 2000);

    let top = bundle.items.first().expect("top item");
    assert_eq!(
        top.span_ref.as_ref().map(|s| s.span_id.as_str()),
        Some(definition.span_id.as_str()),
        "the definition leads the bundle"
    );
    let test_item = bundle
        .items
        .iter()
        .find(|item| {
            item.span_ref.as_ref().map(|s| s.span_id.as_str()) == Some(test.span_id.as_str())
        })
        .expect("test span included");
    assert!(
        test_item.source.contains("graph"),
        "the test arrives through the test-of edge, source was {}",
        test_item.source
    );
}

/// Scenario 2: config query with a TOML fixture; symbols are excluded and
/// the config chunk leads.
#[tokio::test]
async fn config_intent_prefers_config_files_over_functions() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    FileRecord::new("demo", "config/database.toml", "hash", Some("toml"))
        .upsert(&store)
        .await
        .expect("file");
    span_with_chunk(
        &store,
        "config/database.toml",
        "db.url",
        SpanKind::Constant,
        "db.url",
        "[db]\nurl = \"postgres://localhost/app\"  # database connection",
        0,
    )
    .await;
    for i in 0..3 {
        span_with_chunk(
            &store,
            &format!("src/module_{i}.py"),
            &format!("helper_{i}"),
            SpanKind::Function,
            &format!("def helper_{i}():"),
            &format!("def helper_{i}():\n    return {i}"),
            0,
        )
        .await;
    }

    let pipeline = pipeline(Arc::clone(&store));
    let mut request = AssembleRequest::new("database config");
    request.repo = Some("demo".to_string());
    let bundle = pipeline.assemble(request).await.expect("assemble");

    assert_eq!(bundle.intent, Intent::Config);
    let top = bundle.items.first().expect("top item");
    assert_eq!(
        top.span_ref.as_ref().map(|s| s.path.as_str()),
        Some("config/database.toml")
    );
    for item in bundle.items.iter().take(3) {
        assert_ne!(
            item.span_ref.as_ref().map(|s| s.kind.as_str()),
            Some("function"),
            "no function spans above rank 3"
        );
    }
}

/// Scenario 3: API query; graph expansion follows the route and call
/// edges from the handler to the service method.
#[tokio::test]
async fn api_intent_expands_route_and_call_edges() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    let handler = span_with_chunk(
        &store,
        "handlers.py",
        "create_user_handler",
        SpanKind::Function,
        "def create_user_handler(request):",
        "def create_user_handler(request):\n    # POST /api/users handler\n    return UserService.create(request.json)",
        0,
    )
    .await;
    let create = span_with_chunk(
        &store,
        "service.py",
        "create",
        SpanKind::Method,
        "def create(self, payload):",
        "def create(self, payload):\n    return self.repo.insert(payload)",
        0,
    )
    .await;
    let routes = span_with_chunk(
        &store,
        "routes.py",
        "register_routes",
        SpanKind::Function,
        "def register_routes(app):",
        "def register_routes(app):\n    app.post('/api/users', create_user_handler)",
        0,
    )
    .await;
    Reference::bulk_insert(
        vec![
            Reference::new(&handler.span_id, "service.py", 5, 30, EdgeKind::Call),
            Reference::new(&routes.span_id, "handlers.py", 5, 30, EdgeKind::Routes),
        ],
        &store,
    )
    .await
    .expect("edges");

    let pipeline = pipeline(Arc::clone(&store));
    let mut request = AssembleRequest::new("POST /api/users handler");
    request.repo = Some("demo".to_string());
    request.token_budget = Some(4000);
    let bundle = pipeline.assemble(request).await.expect("assemble");

    assert_eq!(bundle.intent, Intent::Api);
    assert!(bundle
        .items
        .iter()
        .any(|item| item.span_ref.as_ref().map(|s| s.span_id.as_str())
            == Some(handler.span_id.as_str())));
    assert!(
        bundle
            .items
            .iter()
            .any(|item| item.span_ref.as_ref().map(|s| s.span_id.as_str())
                == Some(create.span_id.as_str())),
        "graph expansion pulls UserService.create"
    );

    // The expansion itself reports one call edge and one routes edge.
    let expander = GraphExpander::new(16, Duration::from_secs(60), 8);
    let tokenizers = common::tokenizer::TokenizerFactory::new(TokenizerConfig::default(), 64);
    let expansion = expander
        .expand(
            &store,
            &tokenizers,
            "claude-3-sonnet",
            &[SeedSpan {
                span_id: handler.span_id.clone(),
                score: 1.0,
            }],
            2,
            4000,
            &EdgeKind::ALL,
            &CancellationToken::new(),
        )
        .await
        .expect("expand");
    assert!(expansion.tokens_used <= 4000);
    assert!(expansion.edges.iter().any(|e| e.kind == EdgeKind::Call));
    assert!(expansion.edges.iter().any(|e| e.kind == EdgeKind::Routes));
}

/// Scenario 4: incident query keeps the deeper defaults and pulls the
/// caller chain plus the covering test.
#[tokio::test]
async fn incident_intent_keeps_depth_and_surfaces_tests() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    let checkout = span_with_chunk(
        &store,
        "src/checkout.py",
        "finalize_checkout",
        SpanKind::Function,
        "def finalize_checkout(cart):",
        "def finalize_checkout(cart):\n    # raises a null pointer exception when cart is empty\n    return cart.total()",
        0,
    )
    .await;
    let caller = span_with_chunk(
        &store,
        "src/orders.py",
        "submit_order",
        SpanKind::Function,
        "def submit_order(cart):",
        "def submit_order(cart):\n    return finalize_checkout(cart)",
        0,
    )
    .await;
    let test = span_with_chunk(
        &store,
        "tests/test_checkout.py",
        "test_finalize_checkout",
        SpanKind::Function,
        "def test_finalize_checkout():",
        "def test_finalize_checkout():\n    assert finalize_checkout(cart()) == 0",
        0,
    )
    .await;
    Reference::bulk_insert(
        vec![
            Reference::new(&caller.span_id, "src/checkout.py", 5, 30, EdgeKind::Call),
            Reference::new(&test.span_id, "src/checkout.py", 5, 30, EdgeKind::TestOf),
        ],
        &store,
    )
    .await
    .expect("edges");

    let pipeline = pipeline(Arc::clone(&store));
    let mut request = AssembleRequest::new("null pointer exception in checkout");
    request.repo = Some("demo".to_string());
    let bundle = pipeline.assemble(request).await.expect("assemble");

    assert_eq!(bundle.intent, Intent::Incident);
    assert!(bundle
        .items
        .iter()
        .any(|item| item.span_ref.as_ref().map(|s| s.span_id.as_str())
            == Some(checkout.span_id.as_str())));
    assert!(
        bundle
            .items
            .iter()
            .any(|item| item.span_ref.as_ref().map(|s| s.span_id.as_str())
                == Some(caller.span_id.as_str())),
        "caller chain is present"
    );
    assert!(
        bundle
            .items
            .iter()
            .any(|item| item.span_ref.as_ref().map(|s| s.span_id.as_str())
                == Some(test.span_id.as_str())),
        "a test span arrives through the test-of edge"
    );
}

/// Scenario 5: a 500-token budget against ~3000 tokens of candidates
/// degrades with capsules rather than overrunning.
#[tokio::test]
async fn tight_budgets_degrade_with_capsules() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    for i in 0..10 {
        let body = format!(
            "def renderer_{i}(frame):\n{}",
            "    surface.blit(frame, position)\n".repeat(40)
        );
        span_with_chunk(
            &store,
            &format!("src/render_{i}.py"),
            &format!("renderer_{i}"),
            SpanKind::Function,
            &format!("def renderer_{i}(frame):"),
            &body,
            0,
        )
        .await;
    }

    let pipeline = pipeline(Arc::clone(&store));
    let mut request = AssembleRequest::new("renderer frame blit surface");
    request.repo = Some("demo".to_string());
    request.token_budget = Some(500);
    let bundle = pipeline.assemble(request).await.expect("assemble");

    assert!(bundle.token_report.actual <= 500, "budget respected");
    assert!(
        bundle.degradation_level >= 2,
        "level {} under heavy pressure",
        bundle.degradation_level
    );
    assert!(
        bundle
            .items
            .iter()
            .any(|item| item.tier == "supplementary" && item.degradation_level >= 1),
        "supplementary items arrive as capsules"
    );
    assert!(
        bundle
            .stopping_reasons
            .iter()
            .any(|reason| reason.message.contains("of 500")),
        "budget exhaustion cites used/budget numbers: {:?}",
        bundle.stopping_reasons
    );
}

/// Cancellation propagates from the token to a typed error.
#[tokio::test]
async fn cancelled_requests_fail_with_the_cancelled_kind() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    let pipeline = pipeline(store);
    let mut request = AssembleRequest::new("anything at all");
    request.cancel = CancellationToken::new();
    request.cancel.cancel();

    let err = pipeline.assemble(request).await.expect_err("cancelled");
    assert!(matches!(err, common::error::PampaxError::Cancelled(_)));
}

/// Determinism: identical stores and requests produce identical bundles.
#[tokio::test]
async fn bundles_are_deterministic_for_identical_inputs() {
    let store = Arc::new(SqliteStore::in_memory().expect("store"));
    for i in 0..5 {
        span_with_chunk(
            &store,
            &format!("src/mod_{i}.py"),
            &format!("worker_{i}"),
            SpanKind::Function,
            &format!("def worker_{i}():"),
            &format!("def worker_{i}():\n    return queue.pop()"),
            0,
        )
        .await;
    }

    let pipeline = pipeline(Arc::clone(&store));
    let make_request = || {
        let mut request = AssembleRequest::new("queue worker pop");
        request.repo = Some("demo".to_string());
        request
    };

    let first = pipeline.assemble(make_request()).await.expect("first");
    let second = pipeline.assemble(make_request()).await.expect("second");

    let first_ids: Vec<&str> = first.items.iter().map(|i| i.chunk_id.as_str()).collect();
    let second_ids: Vec<&str> = second.items.iter().map(|i| i.chunk_id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}
