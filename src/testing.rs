//! Scripted backend used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ETAG};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::api::types::{RawResponse, UploadFile};
use crate::api::Backend;
use crate::error::{DataError, Result};

#[derive(Default)]
pub struct MockBackend {
  gets: Mutex<HashMap<String, VecDeque<RawResponse>>>,
  posts: Mutex<HashMap<String, VecDeque<RawResponse>>>,
  deletes: Mutex<HashMap<String, VecDeque<RawResponse>>>,
  uploads: Mutex<VecDeque<RawResponse>>,
  downloads: Mutex<VecDeque<RawResponse>>,
  offline: AtomicBool,
  transfer_delay: Mutex<Duration>,
  get_calls: AtomicUsize,
  upload_calls: AtomicUsize,
  download_calls: AtomicUsize,
  post_log: Mutex<Vec<(String, Value)>>,
  delete_log: Mutex<Vec<String>>,
  last_get_headers: Mutex<HeaderMap>,
  upload_keys: Mutex<Vec<String>>,
}

pub fn json_response(status: StatusCode, body: Value, etag: Option<&str>) -> RawResponse {
  let mut response = RawResponse::new(status, body.to_string());
  if let Some(etag) = etag {
    response
      .headers
      .insert(ETAG, HeaderValue::from_str(etag).unwrap());
  }
  response
}

impl MockBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_transfer_delay(&self, delay: Duration) {
    *self.transfer_delay.lock().unwrap() = delay;
  }

  pub fn push_get(&self, path: &str, response: RawResponse) {
    self
      .gets
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn push_get_json(&self, path: &str, body: Value, etag: Option<&str>) {
    self.push_get(path, json_response(StatusCode::OK, body, etag));
  }

  pub fn push_get_status(&self, path: &str, status: StatusCode) {
    self.push_get(path, RawResponse::new(status, ""));
  }

  pub fn push_post(&self, path: &str, response: RawResponse) {
    self
      .posts
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn push_presign(&self, operation: &str, expires_in_seconds: u64) {
    self.push_post(
      &format!("/api/v1/files/presign/{}", operation),
      json_response(
        StatusCode::OK,
        json!({
          "token": "tok",
          "url": format!("http://mock/api/v1/files/presign/{}?token=tok", operation),
          "expiresInSeconds": expires_in_seconds,
        }),
        None,
      ),
    );
  }

  pub fn push_delete(&self, path: &str, response: RawResponse) {
    self
      .deletes
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn push_upload(&self, response: RawResponse) {
    self.uploads.lock().unwrap().push_back(response);
  }

  pub fn push_download(&self, response: RawResponse) {
    self.downloads.lock().unwrap().push_back(response);
  }

  pub fn get_calls(&self) -> usize {
    self.get_calls.load(Ordering::SeqCst)
  }

  pub fn upload_calls(&self) -> usize {
    self.upload_calls.load(Ordering::SeqCst)
  }

  pub fn download_calls(&self) -> usize {
    self.download_calls.load(Ordering::SeqCst)
  }

  pub fn post_calls(&self, path: &str) -> usize {
    self
      .post_log
      .lock()
      .unwrap()
      .iter()
      .filter(|(p, _)| p == path)
      .count()
  }

  pub fn post_bodies(&self, path: &str) -> Vec<Value> {
    self
      .post_log
      .lock()
      .unwrap()
      .iter()
      .filter(|(p, _)| p == path)
      .map(|(_, body)| body.clone())
      .collect()
  }

  pub fn delete_calls(&self) -> Vec<String> {
    self.delete_log.lock().unwrap().clone()
  }

  pub fn last_get_headers(&self) -> HeaderMap {
    self.last_get_headers.lock().unwrap().clone()
  }

  pub fn upload_keys(&self) -> Vec<String> {
    self.upload_keys.lock().unwrap().clone()
  }

  /// Calls that reached the network layer of any kind.
  pub fn total_calls(&self) -> usize {
    self.get_calls()
      + self.upload_calls()
      + self.download_calls()
      + self.post_log.lock().unwrap().len()
      + self.delete_log.lock().unwrap().len()
  }

  fn check_online(&self) -> Result<()> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(DataError::NetworkUnavailable("mock offline".to_string()));
    }
    Ok(())
  }

  fn next(queue: Option<&mut VecDeque<RawResponse>>) -> RawResponse {
    queue
      .and_then(|q| q.pop_front())
      .unwrap_or_else(|| RawResponse::new(StatusCode::NOT_FOUND, "unscripted"))
  }

  async fn delay(&self) {
    let delay = *self.transfer_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }
}

#[async_trait]
impl Backend for MockBackend {
  async fn get(&self, path: &str, headers: HeaderMap) -> Result<RawResponse> {
    self.get_calls.fetch_add(1, Ordering::SeqCst);
    *self.last_get_headers.lock().unwrap() = headers;
    self.check_online()?;
    Ok(Self::next(self.gets.lock().unwrap().get_mut(path)))
  }

  async fn post_json(&self, path: &str, body: &Value) -> Result<RawResponse> {
    self
      .post_log
      .lock()
      .unwrap()
      .push((path.to_string(), body.clone()));
    self.check_online()?;
    Ok(Self::next(self.posts.lock().unwrap().get_mut(path)))
  }

  async fn delete(&self, path: &str) -> Result<RawResponse> {
    self.delete_log.lock().unwrap().push(path.to_string());
    self.check_online()?;
    Ok(Self::next(self.deletes.lock().unwrap().get_mut(path)))
  }

  async fn upload(
    &self,
    _url: &str,
    _file: &UploadFile,
    _folder_id: u64,
    idempotency_key: &str,
  ) -> Result<RawResponse> {
    self.upload_calls.fetch_add(1, Ordering::SeqCst);
    self
      .upload_keys
      .lock()
      .unwrap()
      .push(idempotency_key.to_string());
    self.check_online()?;
    self.delay().await;
    Ok(Self::next(Some(&mut *self.uploads.lock().unwrap())))
  }

  async fn download(&self, _url: &str, _idempotency_key: &str) -> Result<RawResponse> {
    self.download_calls.fetch_add(1, Ordering::SeqCst);
    self.check_online()?;
    self.delay().await;
    Ok(Self::next(Some(&mut *self.downloads.lock().unwrap())))
  }
}
