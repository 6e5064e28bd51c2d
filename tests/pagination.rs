//! Pagination through the client against a local mock server.

use fetchline::pagination::{CursorOptions, PageNumberOptions};
use fetchline::{Client, PaginationOptions};
use futures::StreamExt;
use mockito::{Matcher, Server};
use reqwest::Method;
use serde_json::{json, Value};

async fn client(server: &Server) -> Client {
    Client::builder().base_url(server.url()).build().await.unwrap()
}

#[tokio::test]
async fn numeric_pages_stop_at_first_empty_page() {
    let mut server = Server::new_async().await;
    let bodies = [r#"{"items":[1,2]}"#, r#"{"items":[3,4]}"#, r#"{"items":[]}"#];
    let mut mocks = Vec::new();
    for (i, body) in bodies.iter().enumerate() {
        mocks.push(
            server
                .mock("GET", "/things")
                .match_query(Matcher::UrlEncoded("page".into(), (i + 1).to_string()))
                .with_status(200)
                .with_body(*body)
                .expect(1)
                .create_async()
                .await,
        );
    }
    let beyond = server
        .mock("GET", "/things")
        .match_query(Matcher::UrlEncoded("page".into(), "4".into()))
        .expect(0)
        .create_async()
        .await;

    let client = client(&server).await;
    let first = client.new_request(Method::GET, "things").unwrap();
    let opts = PaginationOptions::default().with_page_number(PageNumberOptions::default());

    let pages: Vec<_> = client.pages(first, opts).collect().await;
    assert_eq!(pages.len(), 3);
    let numbers: Vec<usize> = pages.iter().map(|p| p.as_ref().unwrap().page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    for mock in mocks {
        mock.assert_async().await;
    }
    beyond.assert_async().await;
}

#[tokio::test]
async fn page_cap_bounds_requests() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/endless")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data":["x"]}"#)
        .expect(5)
        .create_async()
        .await;

    let client = client(&server).await;
    let first = client.new_request(Method::GET, "endless").unwrap();
    let opts = PaginationOptions::default()
        .with_page_number(PageNumberOptions::default())
        .with_max_pages(5);
    let items: Vec<Value> = client
        .paginate(first, opts)
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(items.len(), 5);
    mock.assert_async().await;
}

#[tokio::test]
async fn link_header_is_followed() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/feed")
        .with_status(200)
        .with_header("link", "</feed/2?after=abc>; rel=\"next\", </feed>; rel=\"first\"")
        .with_body("[1,2]")
        .create_async()
        .await;
    server
        .mock("GET", "/feed/2")
        .match_query(Matcher::UrlEncoded("after".into(), "abc".into()))
        .with_status(200)
        .with_body("[3]")
        .create_async()
        .await;

    let client = client(&server).await;
    let first = client.new_request(Method::GET, "feed").unwrap();
    let items: Vec<Value> = client
        .paginate(first, PaginationOptions::new())
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn cursor_from_body_is_sent_as_query_parameter() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/events")
        .match_query(Matcher::Exact("limit=2".into()))
        .with_status(200)
        .with_body(r#"{"data":["a","b"],"meta":{"next_cursor":"c-2"}}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/events")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "2".into()),
            Matcher::UrlEncoded("cursor".into(), "c-2".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"data":["c"],"meta":{}}"#)
        .create_async()
        .await;

    let client = client(&server).await;
    let first = client.new_request(Method::GET, "events?limit=2").unwrap();
    let opts = PaginationOptions::default().with_cursor(CursorOptions::new("meta.next_cursor"));
    let items: Vec<Value> = client
        .paginate(first, opts)
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn http_error_ends_the_stream() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/broken")
        .with_status(500)
        .create_async()
        .await;

    let client = client(&server).await;
    let first = client.new_request(Method::GET, "broken").unwrap();
    let pages: Vec<_> = client.pages(first, PaginationOptions::new()).collect().await;
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].as_ref().unwrap_err().status(), Some(500));
}
