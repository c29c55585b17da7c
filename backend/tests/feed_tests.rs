use futures::{Stream, StreamExt};
use vimarsha_portal::{
    MaterialFeed,
    feed::MaterialEvent,
    models::MaterialRecord,
};

fn event(id: &str) -> MaterialEvent {
    MaterialEvent::Created {
        record: MaterialRecord {
            material_id: id.to_string(),
            ..MaterialRecord::default()
        },
    }
}

#[tokio::test]
async fn test_subscriber_receives_published_events_in_order() {
    let feed = MaterialFeed::default();
    let mut events = Box::pin(feed.subscribe());

    feed.publish(event("M1"));
    feed.publish(event("M2"));

    assert_eq!(events.next().await.unwrap().record().material_id, "M1");
    assert_eq!(events.next().await.unwrap().record().material_id, "M2");
}

/// Takes the feed by value, so the returned stream must not borrow it.
fn detached_subscription(feed: MaterialFeed) -> impl Stream<Item = MaterialEvent> {
    feed.subscribe()
}

#[tokio::test]
async fn test_subscription_outlives_the_feed_handle_it_came_from() {
    let feed = MaterialFeed::default();
    let mut events = Box::pin(detached_subscription(feed.clone()));
    assert_eq!(feed.active_subscribers(), 1);

    feed.publish(event("M1"));

    assert_eq!(events.next().await.unwrap().record().material_id, "M1");
}

#[tokio::test]
async fn test_publish_without_subscribers_is_harmless() {
    let feed = MaterialFeed::default();
    feed.publish(event("M1"));
    assert_eq!(feed.active_subscribers(), 0);
}

#[tokio::test]
async fn test_dropping_stream_cancels_subscription() {
    let feed = MaterialFeed::default();

    let first = feed.subscribe();
    let second = feed.subscribe();
    assert_eq!(feed.active_subscribers(), 2);

    drop(first);
    assert_eq!(feed.active_subscribers(), 1);
    drop(second);
    assert_eq!(feed.active_subscribers(), 0);
}

#[tokio::test]
async fn test_lagging_subscriber_skips_ahead() {
    let feed = MaterialFeed::new(2);
    let mut events = Box::pin(feed.subscribe());

    for n in 1..=5 {
        feed.publish(event(&format!("M{n}")));
    }

    // Only the newest `capacity` events are still buffered.
    assert_eq!(events.next().await.unwrap().record().material_id, "M4");
    assert_eq!(events.next().await.unwrap().record().material_id, "M5");
}

#[test]
fn test_event_wire_shape() {
    let json = serde_json::to_value(event("M1")).unwrap();
    assert_eq!(json["kind"], "created");
    assert_eq!(json["record"]["materialId"], "M1");
}
