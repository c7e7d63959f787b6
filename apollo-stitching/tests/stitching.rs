use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use apollo_stitching::Configuration;
use apollo_stitching::Context;
use apollo_stitching::LocalSchema;
use apollo_stitching::MergedTypeConfig;
use apollo_stitching::StitchedSchema;
use apollo_stitching::SubschemaConfig;
use apollo_stitching::configuration::BatchingOptions;
use apollo_stitching::executor::ExecutionRequest;
use apollo_stitching::executor::Executor;
use apollo_stitching::executor::executor_fn;
use apollo_stitching::graphql::Error;
use apollo_stitching::graphql::Request;
use apollo_stitching::graphql::Response;
use apollo_stitching::json_ext::Object;
use apollo_stitching::json_ext::Path;
use apollo_stitching::json_ext::Value;
use parking_lot::Mutex;
use serde_json_bytes::ByteString;
use serde_json_bytes::json;
use tower::BoxError;

const GATEWAY: &str = r#"
    type Query { user(id: ID!): User }
    type User { id: ID! name: String reviews: [Review] }
    type Review { id: ID! body: String product: Product }
    type Product { upc: ID! name: String price: Int }
"#;

fn counted(local: LocalSchema, calls: Arc<AtomicUsize>) -> Arc<dyn Executor> {
    let local = Arc::new(local);
    executor_fn(move |request: ExecutionRequest| {
        let local = local.clone();
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, BoxError>(local.execute_sync(&request)) }
    })
}

fn string_arg(args: &Object, name: &str) -> Value {
    args.get(name).cloned().unwrap_or_default()
}

fn field_of(parent: &Value, name: &str) -> Value {
    parent
        .as_object()
        .and_then(|object| object.get(name))
        .cloned()
        .unwrap_or_default()
}

fn by_id(id_field: &'static str) -> impl Fn(&Value) -> Object + Send + Sync + 'static {
    move |object| {
        let mut args = Object::new();
        args.insert(ByteString::from("id"), object[id_field].clone());
        args
    }
}

fn users(calls: Arc<AtomicUsize>) -> SubschemaConfig {
    let local = LocalSchema::parse(
        "users",
        "type Query { user(id: ID!): User } type User { id: ID! name: String }",
    )
    .unwrap()
    .with_resolver("Query", "user", |_, args, _| {
        let id = string_arg(args, "id");
        let name = if id == json!("2") { "Grace" } else { "Ada" };
        Ok(json!({ "id": id, "name": name }))
    });
    SubschemaConfig::local("users", local.clone())
        .with_executor(counted(local, calls))
        .with_merged_type(
            "User",
            MergedTypeConfig::new()
                .with_selection_set("{ id }")
                .with_field_name("user")
                .with_args(by_id("id")),
        )
}

fn reviews() -> SubschemaConfig {
    let local = LocalSchema::parse(
        "reviews",
        r#"
        type Query { _user(id: ID!): User }
        type User { id: ID! reviews: [Review] }
        type Review { id: ID! body: String product: Product }
        type Product { upc: ID! }
        "#,
    )
    .unwrap()
    .with_resolver("Query", "_user", |_, args, _| {
        Ok(json!({
            "id": string_arg(args, "id"),
            "reviews": [
                { "id": "r1", "body": "Love it", "product": { "upc": "1" } },
                { "id": "r2", "body": "Meh", "product": { "upc": "2" } },
                { "id": "r3", "body": "Again", "product": { "upc": "1" } },
            ],
        }))
    });
    SubschemaConfig::local("reviews", local).with_merged_type(
        "User",
        MergedTypeConfig::new()
            .with_selection_set("{ id }")
            .with_field_name("_user")
            .with_args(by_id("id")),
    )
}

/// Products, recording the keys of every `productsByUpcs` call. The price of
/// product `2` is an error.
fn products(calls: Arc<AtomicUsize>, keys: Arc<Mutex<Vec<Value>>>) -> SubschemaConfig {
    let local = LocalSchema::parse(
        "products",
        "type Query { productsByUpcs(upcs: [ID!]!): [Product] } type Product { upc: ID! name: String price: Int }",
    )
    .unwrap()
    .with_resolver("Query", "productsByUpcs", move |_, args, _| {
        let upcs = string_arg(args, "upcs");
        keys.lock().push(upcs.clone());
        let products = upcs
            .as_array()
            .into_iter()
            .flatten()
            .map(|upc| match upc.as_str() {
                Some("1") => json!({ "upc": "1", "name": "Table", "price": 899 }),
                Some("2") => json!({ "upc": "2", "name": "Chair", "price": 54 }),
                _ => Value::Null,
            })
            .collect();
        Ok(Value::Array(products))
    })
    .with_resolver("Product", "price", |parent, _, _| {
        if field_of(parent, "upc") == json!("2") {
            return Err(Error::builder().message("price unavailable").build());
        }
        Ok(field_of(parent, "price"))
    });
    SubschemaConfig::local("products", local.clone()).with_executor(counted(local, calls))
}

fn product_keys() -> MergedTypeConfig {
    MergedTypeConfig::new()
        .with_selection_set("{ upc }")
        .with_field_name("productsByUpcs")
        .with_key(|object| object["upc"].clone())
        .with_args_from_keys(|keys| {
            let mut args = Object::new();
            args.insert(ByteString::from("upcs"), Value::Array(keys.to_vec()));
            args
        })
}

struct Fixture {
    schema: StitchedSchema,
    user_calls: Arc<AtomicUsize>,
    product_calls: Arc<AtomicUsize>,
    product_keys: Arc<Mutex<Vec<Value>>>,
}

fn fixture(batch_users: bool) -> Fixture {
    let user_calls = Arc::new(AtomicUsize::new(0));
    let product_calls = Arc::new(AtomicUsize::new(0));
    let keys = Arc::new(Mutex::new(Vec::new()));
    let mut users = users(user_calls.clone());
    if batch_users {
        users = users.with_batching(BatchingOptions::default());
    }
    let schema = StitchedSchema::builder()
        .schema(GATEWAY)
        .subschema(users)
        .subschema(reviews())
        .subschema(
            products(product_calls.clone(), keys.clone()).with_merged_type("Product", product_keys()),
        )
        .build()
        .unwrap();
    Fixture {
        schema,
        user_calls,
        product_calls,
        product_keys: keys,
    }
}

async fn execute(schema: &StitchedSchema, query: &str) -> Response {
    schema
        .execute(Request::builder().query(query).build(), Context::new())
        .await
}

#[test_log::test(tokio::test)]
async fn merges_fields_unique_to_another_subschema() {
    let fixture = fixture(false);
    let response = execute(&fixture.schema, r#"{ user(id: "1") { name reviews { body } } }"#).await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    insta::assert_json_snapshot!(response.data, @r#"
    {
      "user": {
        "name": "Ada",
        "reviews": [
          {
            "body": "Love it"
          },
          {
            "body": "Meh"
          },
          {
            "body": "Again"
          }
        ]
      }
    }
    "#);
    assert_eq!(fixture.user_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.product_calls.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test)]
async fn resolves_three_hops_with_one_batched_fetch() {
    let fixture = fixture(false);
    let response = execute(
        &fixture.schema,
        r#"{ user(id: "1") { name reviews { body product { name } } } }"#,
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({
            "user": {
                "name": "Ada",
                "reviews": [
                    { "body": "Love it", "product": { "name": "Table" } },
                    { "body": "Meh", "product": { "name": "Chair" } },
                    { "body": "Again", "product": { "name": "Table" } },
                ]
            }
        }))
    );
    assert_eq!(fixture.product_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*fixture.product_keys.lock(), vec![json!(["1", "2"])]);
}

#[tokio::test]
async fn batched_errors_are_located_at_their_own_key() {
    let fixture = fixture(false);
    let response = execute(
        &fixture.schema,
        r#"{ user(id: "1") { reviews { product { upc price } } } }"#,
    )
    .await;
    assert_eq!(
        response.data,
        Some(json!({
            "user": {
                "reviews": [
                    { "product": { "upc": "1", "price": 899 } },
                    { "product": { "upc": "2", "price": null } },
                    { "product": { "upc": "1", "price": 899 } },
                ]
            }
        }))
    );
    assert_eq!(response.errors.len(), 1, "{:?}", response.errors);
    assert_eq!(response.errors[0].message, "price unavailable");
    assert_eq!(
        response.errors[0].path,
        Some(Path::from("user/reviews/1/product/price"))
    );
}

#[tokio::test]
async fn root_fields_of_one_tick_share_a_fetch() {
    let fixture = fixture(true);
    let response = execute(
        &fixture.schema,
        r#"{ a: user(id: "1") { name } b: user(id: "2") { name } }"#,
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({ "a": { "name": "Ada" }, "b": { "name": "Grace" } }))
    );
    assert_eq!(fixture.user_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keys_are_batched_on_a_multi_thread_runtime() {
    for _ in 0..20 {
        let fixture = fixture(false);
        let response = execute(
            &fixture.schema,
            r#"{ user(id: "1") { reviews { product { name } } } }"#,
        )
        .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(fixture.product_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*fixture.product_keys.lock(), vec![json!(["1", "2"])]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn root_fields_are_batched_on_a_multi_thread_runtime() {
    for _ in 0..20 {
        let fixture = fixture(true);
        let response = execute(
            &fixture.schema,
            r#"{ a: user(id: "1") { name } b: user(id: "2") { name } }"#,
        )
        .await;
        assert_eq!(
            response.data,
            Some(json!({ "a": { "name": "Ada" }, "b": { "name": "Grace" } }))
        );
        assert_eq!(fixture.user_calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn separate_requests_are_never_batched_together() {
    let fixture = fixture(true);
    let (first, second) = futures::join!(
        execute(&fixture.schema, r#"{ user(id: "1") { name } }"#),
        execute(&fixture.schema, r#"{ user(id: "2") { name } }"#),
    );
    assert_eq!(first.data, Some(json!({ "user": { "name": "Ada" } })));
    assert_eq!(second.data, Some(json!({ "user": { "name": "Grace" } })));
    assert_eq!(fixture.user_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn merged_types_can_be_configured_in_yaml() {
    let configuration = Configuration::from_str(
        r#"
subschemas:
  products:
    merge:
      Product:
        selection_set: "{ upc }"
        field_name: productsByUpcs
        key_field: upc
        keys_arg: upcs
"#,
    )
    .unwrap();
    let product_calls = Arc::new(AtomicUsize::new(0));
    let keys = Arc::new(Mutex::new(Vec::new()));
    let schema = StitchedSchema::builder()
        .schema(GATEWAY)
        .subschema(users(Arc::new(AtomicUsize::new(0))))
        .subschema(reviews())
        .subschema(products(product_calls.clone(), keys.clone()))
        .configuration(configuration)
        .build()
        .unwrap();
    let response = execute(&schema, r#"{ user(id: "1") { reviews { product { name } } } }"#).await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({
            "user": {
                "reviews": [
                    { "product": { "name": "Table" } },
                    { "product": { "name": "Chair" } },
                    { "product": { "name": "Table" } },
                ]
            }
        }))
    );
    assert_eq!(product_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_unpathed_errors_are_reported_once() {
    let executor = executor_fn(|_request: ExecutionRequest| async {
        Ok::<_, BoxError>(
            Response::builder()
                .data(json!({ "user": { "id": "1", "name": null, "nickname": null } }))
                .error(Error::builder().message("rate limited").build())
                .build(),
        )
    });
    let subschema = SubschemaConfig::new(
        "users",
        "type Query { user(id: ID!): User } type User { id: ID! name: String nickname: String }",
    )
    .unwrap()
    .with_executor(executor);
    let schema = StitchedSchema::builder()
        .schema("type Query { user(id: ID!): User } type User { id: ID! name: String nickname: String }")
        .subschema(subschema)
        .build()
        .unwrap();

    let response = execute(&schema, r#"{ user(id: "1") { id name nickname } }"#).await;
    assert_eq!(
        response.data,
        Some(json!({ "user": { "id": "1", "name": null, "nickname": null } }))
    );
    assert_eq!(response.errors.len(), 1, "{:?}", response.errors);
    assert_eq!(response.errors[0].message, "rate limited");
    assert_eq!(response.errors[0].path, Some(Path::from("user/name")));
}

/// Answers every incremental request with an initial payload holding the user's
/// id and a deferred payload holding its name.
struct Deferring;

#[async_trait::async_trait]
impl Executor for Deferring {
    async fn execute(&self, _request: ExecutionRequest) -> Result<Response, BoxError> {
        Err("only incremental requests are expected".into())
    }

    async fn execute_incremental(
        &self,
        _request: ExecutionRequest,
    ) -> Result<apollo_stitching::graphql::ResponseStream, BoxError> {
        let payloads = vec![
            json!({ "data": { "user": { "__typename": "User", "id": "1" } }, "hasNext": true }),
            json!({
                "incremental": [{ "data": { "name": "Ada" }, "path": ["user"], "label": "_details" }],
                "hasNext": false
            }),
        ];
        let responses = payloads
            .into_iter()
            .map(|payload| Response::from_value("users", payload))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::pin(futures::stream::iter(responses)))
    }
}

#[tokio::test]
async fn deferred_fields_are_awaited_through_the_receiver() {
    const DEFER: &str =
        "directive @defer(label: String, if: Boolean! = true) on FRAGMENT_SPREAD | INLINE_FRAGMENT";
    let sdl = format!("{DEFER} type Query {{ user(id: ID!): User }} type User {{ id: ID! name: String }}");
    let subschema = SubschemaConfig::new("users", &sdl)
        .unwrap()
        .with_executor(Arc::new(Deferring));
    let schema = StitchedSchema::builder()
        .schema(sdl.clone())
        .subschema(subschema)
        .build()
        .unwrap();

    let response = execute(
        &schema,
        r#"{ user(id: "1") { id ... @defer(label: "details") { name } } }"#,
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(response.data, Some(json!({ "user": { "id": "1", "name": "Ada" } })));
}
