use bytes::Bytes;
use coord_cache::CreateMode;
use coord_cache::StoreError;
use coord_cache::TransactionOp;
use tracing_test::traced_test;

use crate::common::setup;

#[tokio::test]
#[traced_test]
async fn test_failed_transaction_leaves_pre_state() {
    let (_store, framework) = setup(Some("tx"));
    let coordinator = framework.transaction_coordinator();

    let ops = vec![
        TransactionOp::Create {
            path: "/node02".into(),
            data: Bytes::new(),
            mode: CreateMode::Persistent,
        },
        TransactionOp::Create {
            path: "/node02/aa".into(),
            data: Bytes::new(),
            mode: CreateMode::Persistent,
        },
        TransactionOp::Delete {
            path: "/node02".into(),
            version: None,
        },
    ];
    let err = coordinator.submit(ops).await.unwrap_err();

    match err {
        StoreError::TransactionFailed { index, cause } => {
            assert_eq!(index, 2);
            // Paths come back relative to the namespace
            assert_eq!(*cause, StoreError::NotEmpty { path: "/node02".into() });
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(framework.check_exists("/node02").await.unwrap(), None);
}

#[tokio::test]
async fn test_committed_transaction_is_visible() {
    let (store, framework) = setup(Some("tx"));

    let result = framework
        .transaction_coordinator()
        .transaction()
        .create("/cfg", "a")
        .set_data("/cfg", "b", Some(0))
        .create_with_mode("/cfg/seq-", Bytes::new(), CreateMode::PersistentSequential)
        .commit()
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result.created_path("/cfg/seq-"), Some("/cfg/seq-0000000000"));
    assert_eq!(
        framework.get_data("/cfg").await.unwrap().data,
        Some(Bytes::from_static(b"b"))
    );
    assert!(coord_cache::StoreClient::read(&store, "/tx/cfg/seq-0000000000")
        .await
        .unwrap()
        .exists);
}
