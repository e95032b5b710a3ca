//! The process-wide AHA client cache. These tests own the whole cache of
//! this test binary, so the empty-cache assertions run before anything is
//! registered.

use ahad::client;
use ahad::core::errors::AhaError;

#[tokio::test]
async fn test_aha_client_cache_lifecycle() {
    // With nothing registered: no name is a miss, a name is not-ready.
    let err = client::get_aha_proxy(None).await.unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));

    let err = client::get_aha_proxy(Some("hehe.haha")).await.unwrap_err();
    assert!(matches!(err, AhaError::NotReady(_)));

    // Identical URL tuples share one refcounted entry.
    let urls = vec![
        "tcp://newp@127.0.0.1:1/".to_string(),
        "tcp://newp@127.0.0.1:2/".to_string(),
    ];
    assert_eq!(client::add_aha_url(&urls), 1);
    assert_eq!(client::add_aha_url(&urls), 2);
    assert_eq!(client::num_aha_clients(), 1);

    assert_eq!(client::del_aha_url(&urls), 1);
    assert_eq!(client::num_aha_clients(), 1);
    assert_eq!(client::del_aha_url(&urls), 0);
    assert_eq!(client::num_aha_clients(), 0);

    // Deleting an unknown tuple is a quiet zero.
    assert_eq!(client::del_aha_url(&["newp".to_string()]), 0);

    // Registered-but-unreachable servers still fail the lookup, but not
    // as an unknown name.
    assert_eq!(client::add_aha_url(&urls), 1);
    let err = client::get_aha_proxy(Some("hehe.haha")).await.unwrap_err();
    assert!(!matches!(err, AhaError::NoSuchName(_)));
    client::del_aha_url(&urls);
}
