//! 外部样本来源：按文本查询获取候选图片

use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use log::debug;
use serde::Deserialize;

const USER_AGENT: &str = concat!("logoscope/", env!("CARGO_PKG_VERSION"));

/// 一张候选图片
#[derive(Debug, Clone)]
pub struct Sample {
    pub url: String,
    pub bytes: Vec<u8>,
}

/// 样本来源
///
/// 返回的数量可能少于 `limit`，也可能为空或包含重复图片，调用者需要自行校验与去重。
/// 单个候选的失败以 `Err` 项出现，不会中断整个流。
pub trait SampleProvider: Send + Sync + 'static {
    fn fetch<'a>(&'a self, query: &'a str, limit: usize) -> BoxStream<'a, Result<Sample>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    image: String,
}

/// 基于 HTTP 图片搜索接口的样本来源
///
/// 接口返回 `{"results": [{"image": url}]}`，每个 url 单独下载。
pub struct HttpSampleProvider {
    client: reqwest::Client,
    endpoint: String,
    concurrency: usize,
}

impl HttpSampleProvider {
    /// `timeout` 作用于每一个请求
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client, endpoint: endpoint.into(), concurrency: 8 })
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>> {
        debug!("搜索图片: {query}");
        let max_results = max_results.to_string();
        let response: SearchResponse = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("max_results", max_results.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("无法解析搜索结果")?;
        Ok(response.results.into_iter().map(|hit| hit.image).collect())
    }

    async fn download(&self, url: String) -> Result<Sample> {
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("下载失败: {url}"))?
            .bytes()
            .await
            .with_context(|| format!("下载中断: {url}"))?;
        Ok(Sample { url, bytes: bytes.to_vec() })
    }
}

impl SampleProvider for HttpSampleProvider {
    fn fetch<'a>(&'a self, query: &'a str, limit: usize) -> BoxStream<'a, Result<Sample>> {
        // 候选数量取两倍，为校验失败与重复留出余量
        stream::once(self.search(query, limit * 2))
            .flat_map(|result| match result {
                Ok(urls) => stream::iter(urls.into_iter().map(Ok::<_, anyhow::Error>)).boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .map(move |url: Result<String>| async move { self.download(url?).await })
            .buffer_unordered(self.concurrency)
            .boxed()
    }
}
