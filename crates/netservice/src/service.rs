use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::connection::Connection;
use crate::error::Result;

/// Which end of a connection an element configures.
///
/// The server side programs the client-facing interface handed to an
/// endpoint, so it applies the *source* addresses. The client side mirrors
/// that and applies the destination ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }
}

/// One interceptor of a Request/Close pipeline.
///
/// `request` typically forwards to `next` first and then applies its own
/// kernel side effect; on failure it runs its own `close` (which forwards
/// `Close` downstream) and returns the original error annotated with the
/// close outcome. `close` removes what `request` added.
#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection>;
    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()>;
}

/// The remainder of a pipeline after the current element.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn NetworkService>],
    outer: Option<&'a Next<'a>>,
}

impl<'a> Next<'a> {
    /// A pipeline made of `elements` with nothing after them.
    pub fn new(elements: &'a [Arc<dyn NetworkService>]) -> Self {
        Self {
            rest: elements,
            outer: None,
        }
    }

    /// An empty tail. Requests come back unchanged and closes succeed.
    pub fn tail() -> Next<'static> {
        Next {
            rest: &[],
            outer: None,
        }
    }

    pub fn request(self, conn: Connection) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => {
                    head.request(
                        conn,
                        Next {
                            rest,
                            outer: self.outer,
                        },
                    )
                    .await
                }
                None => match self.outer {
                    Some(outer) => outer.request(conn).await,
                    None => Ok(conn),
                },
            }
        })
    }

    pub fn close<'c>(self, conn: &'c Connection) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => {
                    head.close(
                        conn,
                        Next {
                            rest,
                            outer: self.outer,
                        },
                    )
                    .await
                }
                None => match self.outer {
                    Some(outer) => outer.close(conn).await,
                    None => Ok(()),
                },
            }
        })
    }
}

/// An ordered list of elements that behaves as a single element.
#[derive(Clone, Default)]
pub struct Chain {
    elements: Vec<Arc<dyn NetworkService>>,
}

impl Chain {
    pub fn new(elements: Vec<Arc<dyn NetworkService>>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Run a Request through the whole chain.
    pub async fn handle_request(&self, conn: Connection) -> Result<Connection> {
        Next::new(&self.elements).request(conn).await
    }

    /// Run a Close through the whole chain.
    pub async fn handle_close(&self, conn: &Connection) -> Result<()> {
        Next::new(&self.elements).close(conn).await
    }
}

#[async_trait]
impl NetworkService for Chain {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        Next {
            rest: &self.elements,
            outer: Some(&next),
        }
        .request(conn)
        .await
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        Next {
            rest: &self.elements,
            outer: Some(&next),
        }
        .close(conn)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_request: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Arc<dyn NetworkService> {
            Arc::new(Self {
                name,
                log: log.clone(),
                fail_request: false,
            })
        }

        fn failing(name: &'static str, log: &Log) -> Arc<dyn NetworkService> {
            Arc::new(Self {
                name,
                log: log.clone(),
                fail_request: true,
            })
        }
    }

    #[async_trait]
    impl NetworkService for Recorder {
        async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
            self.log.lock().unwrap().push(format!("request {}", self.name));
            if self.fail_request {
                return Err(Error::Kernel(format!("{} failed", self.name)));
            }
            let conn = next.request(conn).await?;
            self.log.lock().unwrap().push(format!("after {}", self.name));
            Ok(conn)
        }

        async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("close {}", self.name));
            next.close(conn).await
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn request_visits_elements_in_order() {
        let log = Log::default();
        let chain = Chain::new(vec![Recorder::new("a", &log), Recorder::new("b", &log)]);

        let conn = chain.handle_request(Connection::new("conn-1")).await.unwrap();
        assert_eq!(conn.id, "conn-1");
        assert_eq!(entries(&log), [
            "request a",
            "request b",
            "after b",
            "after a"
        ]);
    }

    #[tokio::test]
    async fn nested_chain_continues_into_outer_elements() {
        let log = Log::default();
        let inner: Arc<dyn NetworkService> = Arc::new(Chain::new(vec![
            Recorder::new("inner-1", &log),
            Recorder::new("inner-2", &log),
        ]));
        let chain = Chain::new(vec![
            Recorder::new("first", &log),
            inner,
            Recorder::new("last", &log),
        ]);

        chain.handle_close(&Connection::new("conn-1")).await.unwrap();
        assert_eq!(entries(&log), [
            "close first",
            "close inner-1",
            "close inner-2",
            "close last"
        ]);
    }

    #[tokio::test]
    async fn failing_element_stops_the_request() {
        let log = Log::default();
        let chain = Chain::new(vec![
            Recorder::new("a", &log),
            Recorder::failing("b", &log),
            Recorder::new("c", &log),
        ]);

        let err = chain.handle_request(Connection::new("conn-1")).await.unwrap_err();
        assert_eq!(err.to_string(), "kernel operation failed: b failed");
        assert_eq!(entries(&log), ["request a", "request b"]);
    }

    #[tokio::test]
    async fn empty_tail_returns_connection_unchanged() {
        let conn = Connection::new("conn-1");
        let out = Next::tail().request(conn.clone()).await.unwrap();
        assert_eq!(out, conn);
        Next::tail().close(&conn).await.unwrap();
    }
}
