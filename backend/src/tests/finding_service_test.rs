// Finding lifecycle transitions driven by the user API

use crate::services::FindingService;
use crate::tests::common::{create_test_db, create_test_system, insert_finding};

#[tokio::test]
async fn test_acknowledge_and_reopen_cycle() {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let service = FindingService::new(pool.clone());

    let id = insert_finding(&pool, system_id, "Disk pressure on /var", "high", "open").await;

    let acked = service.acknowledge(id).await.unwrap();
    assert_eq!(acked.status, "acknowledged");

    let reopened = service.reopen(id).await.unwrap();
    assert_eq!(reopened.status, "open");
    assert_eq!(reopened.reopen_count, 1);
}

#[tokio::test]
async fn test_acknowledge_requires_open_status() {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let service = FindingService::new(pool.clone());

    let id = insert_finding(&pool, system_id, "Old issue", "low", "resolved").await;
    assert!(service.acknowledge(id).await.is_err());
}

#[tokio::test]
async fn test_resolved_findings_cannot_be_reopened() {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let service = FindingService::new(pool.clone());

    let id = insert_finding(&pool, system_id, "Closed issue", "low", "resolved").await;
    assert!(service.reopen(id).await.is_err());

    let finding = service.get(id).await.unwrap();
    assert_eq!(finding.status, "resolved");
}

#[tokio::test]
async fn test_missing_finding_is_not_found() {
    let pool = create_test_db().await;
    let service = FindingService::new(pool.clone());
    assert!(service.get(424242).await.is_err());
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let service = FindingService::new(pool.clone());

    insert_finding(&pool, system_id, "Open one", "high", "open").await;
    insert_finding(&pool, system_id, "Resolved one", "low", "resolved").await;

    let all = service.list_for_system(system_id, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let open = service.list_for_system(system_id, Some("open")).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].text, "Open one");
}
