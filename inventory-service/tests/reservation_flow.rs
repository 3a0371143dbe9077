mod common;

use common::{optimistic_service, TTL};
use inventory_service::error::InventoryError;
use inventory_service::models::{OutboxStatus, ReservationStatus};
use inventory_service::store::InventoryStore;
use uuid::Uuid;

#[tokio::test]
async fn reserve_moves_stock_and_rejects_shortage() {
    let (service, _store) = optimistic_service();
    service.add_stock("LAPTOP-001", 100).await.unwrap();

    service
        .reserve("LAPTOP-001", "order-A", 30, TTL)
        .await
        .unwrap();
    let levels = service.get_stock("LAPTOP-001").await.unwrap();
    assert_eq!((levels.available, levels.reserved, levels.total), (70, 30, 100));

    let err = service
        .reserve("LAPTOP-001", "order-B", 80, TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::InsufficientStock { .. }));

    // Failed reserve left the ledger untouched.
    let levels = service.get_stock("LAPTOP-001").await.unwrap();
    assert_eq!((levels.available, levels.reserved, levels.total), (70, 30, 100));
}

#[tokio::test]
async fn release_credits_back_and_marks_reservation() {
    let (service, store) = optimistic_service();
    service.add_stock("LAPTOP-001", 100).await.unwrap();
    let reservation_id = service
        .reserve("LAPTOP-001", "order-A", 30, TTL)
        .await
        .unwrap();

    service.release(reservation_id).await.unwrap();

    let levels = service.get_stock("LAPTOP-001").await.unwrap();
    assert_eq!((levels.available, levels.reserved), (100, 0));

    let reservation = store
        .get_reservation(reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Released);
    assert!(reservation.released_at.is_some());
}

#[tokio::test]
async fn release_is_idempotent() {
    let (service, _store) = optimistic_service();
    service.add_stock("SKU-X", 50).await.unwrap();
    let reservation_id = service.reserve("SKU-X", "order-A", 10, TTL).await.unwrap();

    service.release(reservation_id).await.unwrap();
    service.release(reservation_id).await.unwrap();

    // Second release moved nothing.
    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!((levels.available, levels.reserved, levels.total), (50, 0, 50));
}

#[tokio::test]
async fn duplicate_order_line_fails_and_ledger_changes_once() {
    let (service, _store) = optimistic_service();
    service.add_stock("SKU-X", 100).await.unwrap();

    service.reserve("SKU-X", "order-C", 10, TTL).await.unwrap();
    let err = service
        .reserve("SKU-X", "order-C", 10, TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::DuplicateReservation { .. }));

    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!((levels.available, levels.reserved), (90, 10));
}

#[tokio::test]
async fn commit_removes_stock_permanently() {
    let (service, store) = optimistic_service();
    service.add_stock("SKU-X", 100).await.unwrap();
    let reservation_id = service.reserve("SKU-X", "order-A", 30, TTL).await.unwrap();

    service.commit(reservation_id).await.unwrap();

    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!((levels.available, levels.reserved, levels.total), (70, 0, 70));

    let reservation = store
        .get_reservation(reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Committed);

    // Commit on a committed reservation is a no-op success.
    service.commit(reservation_id).await.unwrap();
    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!(levels.total, 70);
}

#[tokio::test]
async fn release_after_commit_is_a_noop() {
    let (service, _store) = optimistic_service();
    service.add_stock("SKU-X", 20).await.unwrap();
    let reservation_id = service.reserve("SKU-X", "order-A", 5, TTL).await.unwrap();
    service.commit(reservation_id).await.unwrap();

    service.release(reservation_id).await.unwrap();
    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!((levels.available, levels.reserved, levels.total), (15, 0, 15));
}

#[tokio::test]
async fn unknown_ids_surface_not_found() {
    let (service, _store) = optimistic_service();

    let err = service.get_stock("NOPE").await.unwrap_err();
    assert!(matches!(err, InventoryError::ProductNotFound(_)));

    let err = service.release(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, InventoryError::ReservationNotFound(_)));

    let err = service
        .reserve("NOPE", "order-A", 1, TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::ProductNotFound(_)));
}

#[tokio::test]
async fn add_stock_creates_item_and_grows_existing() {
    let (service, _store) = optimistic_service();

    service.add_stock("SKU-NEW", 40).await.unwrap();
    let levels = service.get_stock("SKU-NEW").await.unwrap();
    assert_eq!((levels.available, levels.total), (40, 40));

    service.add_stock("SKU-NEW", 10).await.unwrap();
    let levels = service.get_stock("SKU-NEW").await.unwrap();
    assert_eq!((levels.available, levels.total), (50, 50));

    let err = service.add_stock("SKU-NEW", 0).await.unwrap_err();
    assert!(matches!(err, InventoryError::InvalidState(_)));
}

#[tokio::test]
async fn low_stock_reflects_threshold() {
    let (service, _store) = optimistic_service();
    service.add_stock("SKU-X", 20).await.unwrap();
    assert!(!service.is_low_stock("SKU-X").await.unwrap());

    service.reserve("SKU-X", "order-A", 15, TTL).await.unwrap();
    // 5 available < default threshold of 10
    assert!(service.is_low_stock("SKU-X").await.unwrap());
}

#[tokio::test]
async fn invariant_holds_across_mixed_operations() {
    let (service, _store) = optimistic_service();
    service.add_stock("SKU-X", 100).await.unwrap();

    let a = service.reserve("SKU-X", "order-A", 40, TTL).await.unwrap();
    let b = service.reserve("SKU-X", "order-B", 10, TTL).await.unwrap();
    service.release(a).await.unwrap();
    service.commit(b).await.unwrap();
    service.add_stock("SKU-X", 15).await.unwrap();

    let levels = service.get_stock("SKU-X").await.unwrap();
    assert_eq!(levels.available + levels.reserved, levels.total);
    assert_eq!(levels.total, 105);
}

#[tokio::test]
async fn every_mutation_writes_exactly_one_outbox_event() {
    let (service, store) = optimistic_service();
    service.add_stock("SKU-X", 100).await.unwrap();
    let a = service.reserve("SKU-X", "order-A", 10, TTL).await.unwrap();
    let b = service.reserve("SKU-X", "order-B", 10, TTL).await.unwrap();
    service.release(a).await.unwrap();
    service.commit(b).await.unwrap();

    let events = store.all_events();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "StockAdded",
            "StockReserved",
            "StockReserved",
            "StockReleased",
            "StockCommitted"
        ]
    );
    assert!(events.iter().all(|e| e.status == OutboxStatus::Pending));
}
