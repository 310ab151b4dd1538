//! Three pods befriending each other and sharing a catalog.

use podfed::core::{RelationshipState, VideoUpdatedPayload};
use podfed::Video;
use podfed_testkit::Cluster;

async fn three_friends() -> Cluster {
    let cluster = Cluster::new(3).await.unwrap();

    // Pod 2 befriends pod 3 first, then pod 1 befriends everyone.
    let results = cluster.pod(1).make_friends(&[cluster.host(2)]).await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    let results = cluster
        .pod(0)
        .make_friends(&[cluster.host(1), cluster.host(2)])
        .await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    cluster.settle().await.unwrap();
    cluster
}

async fn catalog(cluster: &Cluster, index: usize) -> Vec<Video> {
    let mut videos = cluster.pod(index).list().await.unwrap();
    videos.sort_by(|a, b| a.record.name.cmp(&b.record.name));
    videos
}

#[tokio::test]
async fn test_every_pod_is_friend_with_the_others() {
    let cluster = three_friends().await;

    for i in 0..3 {
        let pods = cluster.pod(i).list_pods().await.unwrap();
        let friends: Vec<_> = pods
            .iter()
            .filter(|p| p.state == RelationshipState::Friend)
            .map(|p| p.host.clone())
            .collect();
        assert_eq!(friends.len(), 2, "pod {i} friends: {friends:?}");
        assert!(!friends.contains(&cluster.host(i)));
        assert!(pods.iter().all(|p| p.public_key_fingerprint.is_some()));
    }
}

#[tokio::test]
async fn test_uploads_propagate_to_every_pod() {
    let cluster = three_friends().await;

    let first = cluster.upload(0, "my super name for pod 1").await.unwrap();
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let videos = catalog(&cluster, i).await;
        assert_eq!(videos.len(), 1);
        let video = &videos[0];
        assert_eq!(video.uuid(), first.uuid());
        assert_eq!(video.record.name, "my super name for pod 1");
        assert_eq!(video.record.description, "my super description for pod");
        assert_eq!(video.record.tags, vec!["tag1", "tag2"]);
        assert_eq!(video.record.duration, 10);
        assert_eq!(video.record.author, "root");
        assert_eq!(video.record.origin, cluster.host(0));
        assert_eq!(video.record.created_at, first.record.created_at);
        assert_eq!(video.record.content_id, first.record.content_id);
        assert_eq!(video.is_local, i == 0);
    }

    cluster.upload(1, "my super name for pod 2").await.unwrap();
    cluster.settle().await.unwrap();
    cluster.upload(2, "my super name for pod 3").await.unwrap();
    cluster.upload(2, "my super name for pod 3-2").await.unwrap();
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let videos = catalog(&cluster, i).await;
        assert_eq!(videos.len(), 4);
        let local: Vec<_> = videos.iter().filter(|v| v.is_local).collect();
        assert_eq!(local.len(), if i == 2 { 2 } else { 1 });
        for video in &videos {
            let path = cluster
                .pod(i)
                .resolve(&video.record.content_id)
                .await
                .unwrap();
            assert!(path.exists());
        }
    }
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_same_file_same_content_identifier() {
    let cluster = three_friends().await;

    let a = cluster.upload_bytes(0, "one", b"same bytes").await.unwrap();
    let b = cluster.upload_bytes(1, "two", b"same bytes").await.unwrap();
    cluster.settle().await.unwrap();

    assert_ne!(a.uuid(), b.uuid());
    assert_eq!(a.record.content_id, b.record.content_id);
}

#[tokio::test]
async fn test_views_are_summed_everywhere() {
    let cluster = three_friends().await;

    let first = cluster.upload(0, "first").await.unwrap();
    let second = cluster.upload(1, "second").await.unwrap();
    cluster.settle().await.unwrap();

    for _ in 0..3 {
        cluster.pod(2).view(&first.uuid()).await.unwrap();
    }
    cluster.pod(0).view(&second.uuid()).await.unwrap();
    assert_eq!(cluster.pod(2).pending_views(&first.uuid()), 3);

    assert_eq!(cluster.flush_views().await.unwrap(), 2);
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let pod = cluster.pod(i);
        assert_eq!(pod.get(&first.uuid()).await.unwrap().unwrap().record.views, 3);
        assert_eq!(pod.get(&second.uuid()).await.unwrap().unwrap().record.views, 1);
    }
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_update_propagates() {
    let cluster = three_friends().await;

    let video = cluster.upload(2, "my super name for pod 3").await.unwrap();
    cluster.settle().await.unwrap();

    cluster
        .pod(2)
        .update(
            &video.uuid(),
            VideoUpdatedPayload {
                name: Some("my super video updated".into()),
                description: Some("my super description updated".into()),
                tags: Some(vec!["tagup1".into(), "tagup2".into()]),
            },
        )
        .await
        .unwrap();
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let record = cluster
            .pod(i)
            .get(&video.uuid())
            .await
            .unwrap()
            .unwrap()
            .record;
        assert_eq!(record.name, "my super video updated");
        assert_eq!(record.description, "my super description updated");
        assert_eq!(record.tags, vec!["tagup1", "tagup2"]);
        assert_eq!(record.content_id, video.record.content_id);
        assert!(record.updated_at >= video.record.updated_at);
    }
}

#[tokio::test]
async fn test_removals_propagate() {
    let cluster = three_friends().await;

    cluster.upload(0, "kept").await.unwrap();
    let gone1 = cluster.upload(2, "gone 1").await.unwrap();
    let gone2 = cluster.upload(2, "gone 2").await.unwrap();
    cluster.settle().await.unwrap();

    cluster.pod(2).delete(&gone1.uuid()).await.unwrap();
    cluster.pod(2).delete(&gone2.uuid()).await.unwrap();
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let videos = catalog(&cluster, i).await;
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].record.name, "kept");
        assert!(cluster.pod(i).get(&gone1.uuid()).await.unwrap().is_none());
    }
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_late_friend_receives_snapshot() {
    let cluster = Cluster::new(2).await.unwrap();

    let video = cluster.upload(0, "before friendship").await.unwrap();
    cluster.pod(0).view(&video.uuid()).await.unwrap();
    cluster.flush_views().await.unwrap();

    cluster
        .pod(1)
        .request_friendship(&cluster.host(0))
        .await
        .unwrap();
    cluster.settle().await.unwrap();

    let remote = cluster.pod(1).get(&video.uuid()).await.unwrap().unwrap();
    assert!(!remote.is_local);
    assert_eq!(remote.record.views, 1);
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_gossip_reaches_friends_of_friends() {
    let cluster = Cluster::with_config(3, |c| c.with_gossip(true))
        .await
        .unwrap();
    // A chain: 1 <-> 2 <-> 3.
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.pod(1).request_friendship(&cluster.host(2)).await.unwrap();
    cluster.settle().await.unwrap();

    let video = cluster.upload(0, "gossiped").await.unwrap();
    cluster.settle().await.unwrap();

    let far = cluster.pod(2).get(&video.uuid()).await.unwrap().unwrap();
    assert_eq!(far.record.origin, cluster.host(0));
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_without_gossip_only_direct_friends_hear() {
    let cluster = Cluster::new(3).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.pod(1).request_friendship(&cluster.host(2)).await.unwrap();
    cluster.settle().await.unwrap();

    let video = cluster.upload(0, "direct only").await.unwrap();
    cluster.settle().await.unwrap();

    assert!(cluster.pod(1).get(&video.uuid()).await.unwrap().is_some());
    assert!(cluster.pod(2).get(&video.uuid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_late_joiner_counts_each_view_once() {
    let cluster = Cluster::with_config(3, |c| c.with_gossip(true))
        .await
        .unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    let video = cluster.upload(0, "watched early").await.unwrap();
    cluster.settle().await.unwrap();

    // Pod 2 sees this view event, still queued for pod 1, in pod 2's snapshot.
    cluster.pod(1).view(&video.uuid()).await.unwrap();
    assert_eq!(cluster.pod(1).flush_views().await.unwrap(), 1);

    cluster.pod(2).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.pod(1).propagate_pending().await.unwrap();
    let joined = cluster.pod(2).get(&video.uuid()).await.unwrap().unwrap();
    assert_eq!(joined.record.views, 1);

    // The same event then arrives again, gossiped on by pod 1.
    cluster.pod(2).request_friendship(&cluster.host(0)).await.unwrap();
    cluster.settle().await.unwrap();

    for i in 0..3 {
        let seen = cluster.pod(i).get(&video.uuid()).await.unwrap().unwrap();
        assert_eq!(seen.record.views, 1, "pod {i}");
    }
    assert!(cluster.converged().await.unwrap());
}
