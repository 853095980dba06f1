use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A tiny review site: one city (Paris) with three restaurants, one of which fails
/// halfway through its review pages.
pub struct SiteStub {
    pub base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

const SEARCH_HIT: &str = r#"<!doctype html>
<html><body>
  <div class="result"><a href="/Tourism-g1-Paris.html">Paris, Ile-de-France</a></div>
</body></html>
"#;

const SEARCH_MISS: &str = r#"<!doctype html>
<html><body><p>No results.</p></body></html>
"#;

const TOURISM: &str = r#"<!doctype html>
<html><body>
  <ul>
    <li class="hotels"><span class="contentCount">1,234 (5%)</span></li>
    <li class="forum"><span class="contentCount">87 topics</span></li>
    <li class="restaurants"><span class="contentCount">18,062</span></li>
    <li class="attractions"><span class="contentCount">3,456</span></li>
    <li class="vacationRentals"><span class="contentCount">(new) 12</span></li>
  </ul>
  <a href="/Restaurants-g1-Paris.html">Restaurants</a>
</body></html>
"#;

const RESTAURANTS_PAGE_1: &str = r#"<!doctype html>
<html><body>
  <a href="/Restaurant_Review-g1-d1-Chez_A.html">Chez A</a>
  <a href="/Restaurant_Review-g1-d2-Bistro_B.html">Bistro B</a>
  <a class="nav next" href="/Restaurants-g1-oa30-Paris.html">Next</a>
</body></html>
"#;

const RESTAURANTS_PAGE_2: &str = r#"<!doctype html>
<html><body>
  <a href="/Restaurant_Review-g1-d3-Broken.html">Broken</a>
  <a href="/Restaurant_Review-g1-d1-Chez_A.html#photos">Chez A again</a>
</body></html>
"#;

const CHEZ_A_1: &str = r#"<!doctype html>
<html><body>
  <h1>Chez A</h1>
  <div class="review-container">
    <span class="noQuotes">Lovely, cosy</span>
    <div class="memberOverlayLink" id="UID_1"></div>
    <span class="ratingDate" title="March 3, 2019">2 weeks ago</span>
    <p class="partial_entry">Best "onion soup" in town.</p>
  </div>
  <div class="review-container">
    <span class="noQuotes">Fine</span>
    <div class="memberOverlayLink" id="UID_2"></div>
    <span class="ratingDate" title="March 4, 2019">2 weeks ago</span>
    <p class="partial_entry">Good value.</p>
  </div>
  <a class="nav next" href="/Restaurant_Review-g1-d1-Reviews-or10-Chez_A.html">Next</a>
</body></html>
"#;

const CHEZ_A_2: &str = r#"<!doctype html>
<html><body>
  <h1>Chez A</h1>
  <div class="review-container">
    <span class="noQuotes">Again</span>
    <div class="memberOverlayLink" id="UID_3"></div>
    <span class="ratingDate" title="April 1, 2019">1 week ago</span>
    <p class="partial_entry">Still good.</p>
  </div>
</body></html>
"#;

const BISTRO_B: &str = r#"<!doctype html>
<html><body><h1>Bistro B</h1><p>No reviews yet.</p></body></html>
"#;

const BROKEN: &str = r#"<!doctype html>
<html><body>
  <h1>Broken</h1>
  <div class="review-container">
    <span class="noQuotes">Half</span>
    <p class="partial_entry">Only page one loads.</p>
  </div>
  <a class="nav next" href="/Restaurant_Review-g1-d3-Reviews-or10-Broken.html">Next</a>
</body></html>
"#;

impl SiteStub {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let hits = Arc::new(Mutex::new(HashMap::new()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let server_hits = Arc::clone(&hits);

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
                *server_hits
                    .lock()
                    .unwrap()
                    .entry(path.to_owned())
                    .or_insert(0) += 1;

                let (status, body) = match path {
                    "/Search" => {
                        let city = query
                            .split('&')
                            .find_map(|pair| pair.strip_prefix("q="))
                            .unwrap_or_default()
                            .to_ascii_lowercase();
                        if city == "paris" {
                            (200, SEARCH_HIT)
                        } else {
                            (200, SEARCH_MISS)
                        }
                    }
                    "/Tourism-g1-Paris.html" => (200, TOURISM),
                    "/Restaurants-g1-Paris.html" => (200, RESTAURANTS_PAGE_1),
                    "/Restaurants-g1-oa30-Paris.html" => (200, RESTAURANTS_PAGE_2),
                    "/Restaurant_Review-g1-d1-Chez_A.html" => (200, CHEZ_A_1),
                    "/Restaurant_Review-g1-d1-Reviews-or10-Chez_A.html" => (200, CHEZ_A_2),
                    "/Restaurant_Review-g1-d2-Bistro_B.html" => (200, BISTRO_B),
                    "/Restaurant_Review-g1-d3-Broken.html" => (200, BROKEN),
                    "/Restaurant_Review-g1-d3-Reviews-or10-Broken.html" => {
                        (500, "upstream exploded")
                    }
                    _ => (404, "not found"),
                };

                let mut response = tiny_http::Response::from_string(body).with_status_code(status);
                if status == 200 {
                    let header = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/html; charset=utf-8"[..],
                    )
                    .expect("build header");
                    response = response.with_header(header);
                }
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for SiteStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
