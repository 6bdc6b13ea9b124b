//! Store and queue behavior against a real PostgreSQL.
//!
//! Run with `cargo test --features postgres`. One container is started on
//! first use and shared by every test; each test gets its own database.

#![cfg(feature = "postgres")]

mod common;

use std::sync::Arc;

use abp_measurer::testing::{
    request_log_entry, MockDriver, MockFetcher, MockMatcherFactory, MockPage,
};
use abp_measurer::{
    Buckets, CrawlJob, CrawlRecord, CrawlRecorder, CrawlScheduler, DedupStore, FilterSource,
    JobQueue, JobStatus, JobWorker, JobWorkerConfig, MeasurerConfig, MeasurerDeps,
    PostgresJobQueue, PostgresStore, ResultRecorder, Store, StoreTx,
};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedDatabase {
    url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_DB: OnceCell<SharedDatabase> = OnceCell::const_new();

async fn database_url() -> &'static str {
    let shared = SHARED_DB
        .get_or_init(|| async {
            common::init_tracing();
            let postgres = Postgres::default()
                .with_tag("16")
                .start()
                .await
                .expect("Failed to start Postgres container");
            let host = postgres.get_host().await.expect("container host");
            let port = postgres
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            let url = format!("postgresql://postgres:postgres@{host}:{port}");

            SharedDatabase {
                url,
                _postgres: postgres,
            }
        })
        .await;
    &shared.url
}

/// Create a fresh database and connect to it.
async fn pool() -> PgPool {
    let server = database_url().await;
    let name = format!("measurer_{}", Uuid::new_v4().simple());

    let admin = PgPool::connect(&format!("{server}/postgres"))
        .await
        .expect("connect to test server");
    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&admin)
        .await
        .expect("create test database");
    admin.close().await;

    PgPool::connect(&format!("{server}/{name}"))
        .await
        .expect("connect to test database")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn bulk_rule_registration_writes_every_row_once() {
    let store = PostgresStore::from_pool(pool().await).await.unwrap();
    let dedup = DedupStore::with_limits(Arc::new(store.clone()), 333, 16);
    let salt = Uuid::new_v4().simple().to_string();
    let text = (0..10_000)
        .map(|i| format!("||ads{i}-{salt}.example^"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut tx = store.begin().await.unwrap();
    let list = dedup
        .filter_list(tx.as_mut(), "https://lists.test/big.txt", &text)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(list.created);
    assert_eq!(list.rules.len(), 10_000);
    let (linked,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lists_rules WHERE list_id = $1")
        .bind(list.id.0)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(linked, 10_000);
    let (rules,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rules WHERE text LIKE $1")
        .bind(format!("%{salt}%"))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rules, 10_000);
}

#[tokio::test]
async fn concurrent_registration_converges_on_one_row() {
    let store = PostgresStore::from_pool(pool().await).await.unwrap();
    let dedup = Arc::new(DedupStore::new(Arc::new(store.clone())));
    let text = format!("||{}.example^\n||shared.example^", unique("race"));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let dedup = dedup.clone();
        let text = text.clone();
        tasks.push(tokio::spawn(async move {
            let mut tx = store.begin().await?;
            let list = dedup
                .filter_list(tx.as_mut(), &format!("https://mirror{i}.test/list.txt"), &text)
                .await?;
            tx.commit().await?;
            Ok::<_, abp_measurer::StoreError>(list)
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn lists_sharing_rules_in_opposite_order_register_concurrently() {
    let store = PostgresStore::from_pool(pool().await).await.unwrap();
    let dedup = Arc::new(DedupStore::new(Arc::new(store.clone())));

    for round in 0..25 {
        let x = format!("||{}.example^", unique("x"));
        let y = format!("||{}.example^", unique("y"));
        let texts = [format!("{x}\n{y}"), format!("{y}\n{x}")];

        let mut tasks = Vec::new();
        for (i, text) in texts.into_iter().enumerate() {
            let store = store.clone();
            let dedup = dedup.clone();
            tasks.push(tokio::spawn(async move {
                let mut tx = store.begin().await?;
                let list = dedup
                    .filter_list(tx.as_mut(), &format!("https://lists{i}.test/{round}.txt"), &text)
                    .await?;
                tx.commit().await?;
                Ok::<_, abp_measurer::StoreError>(list)
            }));
        }

        let mut lists = Vec::new();
        for task in tasks {
            lists.push(task.await.unwrap().unwrap());
        }
        assert_ne!(lists[0].id, lists[1].id);
        assert_eq!(lists[0].rules[&x], lists[1].rules[&x]);
        assert_eq!(lists[0].rules[&y], lists[1].rules[&y]);
    }
}

#[tokio::test]
async fn crawls_attaching_shared_lists_in_opposite_order_both_record() {
    let store: Arc<dyn Store> = Arc::new(PostgresStore::from_pool(pool().await).await.unwrap());
    let recorder = Arc::new(ResultRecorder::new(store, &MeasurerConfig::default()));

    for round in 0..10 {
        let shared = format!("||{}.example^", unique("shared"));
        let first = FilterSource {
            url: format!("https://lists.test/{round}/first.txt"),
            text: format!("{shared}\n||{}.example^", unique("first")),
        };
        let second = FilterSource {
            url: format!("https://lists.test/{round}/second.txt"),
            text: format!("||{}.example^\n{shared}", unique("second")),
        };

        let mut tasks = Vec::new();
        for lists in [
            vec![first.clone(), second.clone()],
            vec![second.clone(), first.clone()],
        ] {
            let recorder = recorder.clone();
            let record = CrawlRecord {
                batch: format!("batch-{round}"),
                tags: Vec::new(),
                domain: "site.test".into(),
                url: "http://site.test".into(),
                dwell_secs: 5,
                depth: 1,
                breadth: 0,
                parent: None,
                rank: None,
                region: None,
                filter_lists: lists,
            };
            tasks.push(tokio::spawn(async move {
                recorder.record_crawl(&record, &Buckets::default()).await
            }));
        }

        let mut crawls = Vec::new();
        for task in tasks {
            crawls.push(task.await.unwrap().unwrap());
        }
        assert_ne!(crawls[0], crawls[1]);
    }
}

#[tokio::test]
async fn duplicate_unique_insert_reports_a_conflict() {
    let store = PostgresStore::from_pool(pool().await).await.unwrap();
    let hostname = format!("{}.example", unique("dup"));

    let mut tx = store.begin().await.unwrap();
    let id = tx.insert_domain(&hostname).await.unwrap();
    let err = tx.insert_domain(&hostname).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(tx.find_domain(&hostname).await.unwrap(), Some(id));
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn recursive_crawl_persists_lineage() {
    let pool = pool().await;
    let store = PostgresStore::from_pool(pool.clone()).await.unwrap();
    let queue = Arc::new(PostgresJobQueue::new(pool.clone()).await.unwrap());
    let config = common::test_config();

    let list_url = "https://lists.test/pg.txt";
    let list_text = format!("||ads.example^$script\n||{}.example^", unique("pg"));
    let root = "http://pg-site.test";
    let page = MockPage::new()
        .with_log(request_log_entry("1", root, "https://ads.example/a.js", "Script"))
        .with_log(request_log_entry("2", root, "https://pg-site.test/logo.png", "Image"))
        .with_children(["http://pg-site.test/a", "http://pg-site.test/b"]);

    let deps = MeasurerDeps {
        fetcher: Arc::new(MockFetcher::new().with_text(list_url, list_text)),
        driver: Arc::new(MockDriver::new().with_page(root, page)),
        matchers: Arc::new(MockMatcherFactory::new()),
        recorder: Arc::new(ResultRecorder::new(Arc::new(store.clone()), &config)),
        queue: queue.clone(),
    };
    let scheduler = Arc::new(CrawlScheduler::new(deps, config).with_seed(1));

    let batch = unique("batch");
    let job = CrawlJob::new(batch.clone(), vec![list_url.to_string()])
        .with_domain("pg-site.test")
        .with_secs(0)
        .with_depth(2)
        .with_breadth(2);
    queue.enqueue(&job).await.unwrap();

    let worker = JobWorker::with_config(
        queue.clone(),
        scheduler,
        JobWorkerConfig::with_worker_id(unique("worker")),
    );
    worker.drain().await.unwrap();

    let crawls: Vec<(i64, i32, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT c.id, c.depth, c.parent_crawl_id
        FROM crawls c JOIN batches b ON b.id = c.batch_id
        WHERE b.uuid = $1
        ORDER BY c.id
        "#,
    )
    .bind(&batch)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(crawls.len(), 3);
    let (root_id, root_depth, root_parent) = crawls[0];
    assert_eq!((root_depth, root_parent), (2, None));
    for (_, depth, parent) in &crawls[1..] {
        assert_eq!((*depth, *parent), (1, Some(root_id)));
    }

    let (blocked,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM blocked_requests WHERE crawl_id = $1")
            .bind(root_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    let (allowed,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM allowed_requests WHERE crawl_id = $1")
            .bind(root_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!((blocked, allowed), (1, 1));
}

#[tokio::test]
async fn claims_hand_each_job_to_one_worker() {
    let queue = PostgresJobQueue::new(pool().await).await.unwrap();
    let job = CrawlJob::new(unique("claims"), vec!["https://lists.test/a.txt".into()])
        .with_domain("claims.test");
    let first = queue.enqueue(&job).await.unwrap();
    let second = queue.enqueue(&job).await.unwrap();

    let (a, b) = tokio::join!(queue.claim("worker-a"), queue.claim("worker-b"));
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert_ne!(a.id, b.id);
    assert_eq!((a.attempt, b.attempt), (1, 1));

    let mut claimed = vec![a.id, b.id];
    claimed.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(claimed, expected);

    queue.mark_succeeded(a.id).await.unwrap();
    queue
        .mark_failed(b.id, "browser crashed", "automation")
        .await
        .unwrap();
    assert_eq!(queue.count(JobStatus::Succeeded).await.unwrap(), 1);
    assert_eq!(queue.count(JobStatus::Failed).await.unwrap(), 1);
    assert_eq!(queue.count(JobStatus::Pending).await.unwrap(), 0);
    assert!(queue.claim("worker-a").await.unwrap().is_none());
}
