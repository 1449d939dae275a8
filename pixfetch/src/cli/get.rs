use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use pixfetch_common::config::Config;
use pixfetch_common::error::{FetchError, Result};
use pixfetch_common::{CachePolicy, FetchProgress, FetchResponse, ImageRequest};
use pixfetch_net::{
    HttpResponseValidator, HttpValidatorFactory, ImageFetching, ProgressHandler, StaticHeaders,
    UrlImageFetcher,
};
use tracing::{debug, warn};
use url::Url;

use crate::ui;

#[derive(Args, Debug)]
pub struct Get {
    /// URLs to fetch
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Write each body into this directory instead of only reporting it
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Cache policy for every request (e.g. reload, prefer-cache, offline)
    #[arg(long, value_name = "POLICY")]
    pub cache_policy: Option<CachePolicy>,

    /// Restrict accepted schemes (repeatable); defaults to the configured set
    #[arg(long = "scheme", value_name = "SCHEME")]
    pub schemes: Vec<String>,

    /// Reject HTTP responses outside 2xx
    #[arg(long)]
    pub validate: bool,

    /// Acceptable media types, wildcards allowed (repeatable); implies --validate
    #[arg(long = "accept", value_name = "MIME")]
    pub accept: Vec<String>,

    /// Extra request header (repeatable)
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,
}

struct Pending {
    index: usize,
    url: String,
    bar: ProgressBar,
    result: Result<FetchResponse>,
}

impl Get {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let mut config = config.clone();
        if let Some(policy) = self.cache_policy {
            config.default_cache_policy = policy;
        }
        let fetcher = UrlImageFetcher::new(config)?;
        if !self.schemes.is_empty() {
            fetcher.set_supported_schemes(&self.schemes);
        }

        // Delegates are held weakly by the fetcher; these locals keep them alive.
        let headers = Arc::new(StaticHeaders::parse(self.headers.iter().map(String::as_str))?);
        if !headers.is_empty() {
            fetcher.set_request_customizer(&headers);
        }
        let validators = Arc::new(HttpValidatorFactory::new(self.validator()));
        if self.validate || !self.accept.is_empty() {
            fetcher.set_validator_factory(&validators);
        }

        if let Some(dir) = &self.output {
            tokio::fs::create_dir_all(dir).await?;
        }

        let multi = MultiProgress::new();
        let mut failures: Vec<FetchError> = Vec::new();
        let mut in_flight = Vec::new();

        for (index, url) in self.urls.iter().enumerate() {
            let bar = multi.add(ui::transfer_bar(url));
            let handler: ProgressHandler = {
                let bar = bar.clone();
                Arc::new(move |progress: FetchProgress| ui::apply_progress(&bar, progress))
            };
            match fetcher.fetch(&ImageRequest::new(url.as_str()), Some(handler)) {
                Ok(operation) => {
                    debug!("Issued {} for {}", operation.id(), url);
                    let url = url.clone();
                    in_flight.push(async move {
                        let result = operation.result().await;
                        Pending { index, url, bar, result }
                    });
                }
                Err(e) => {
                    bar.abandon_with_message("rejected".red().to_string());
                    report_failure(url, &e);
                    failures.push(e);
                }
            }
        }

        let all = join_all(in_flight);
        tokio::pin!(all);
        let finished = tokio::select! {
            finished = &mut all => finished,
            Ok(()) = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling {} in-flight fetches", fetcher.in_flight());
                fetcher.cancel_all();
                all.await
            }
        };

        let mut used_names = HashSet::new();
        for Pending { index, url, bar, result } in finished {
            match result {
                Ok(response) => {
                    bar.finish_with_message("done".green().to_string());
                    let written = match &self.output {
                        Some(dir) => {
                            let name = unique_name(
                                file_name_for(&response.response.url, index, &response.data),
                                index,
                                &mut used_names,
                            );
                            match write_body(dir, &name, &response).await {
                                Ok(path) => Some(path),
                                Err(e) => {
                                    report_failure(&url, &e);
                                    failures.push(e);
                                    continue;
                                }
                            }
                        }
                        None => None,
                    };
                    report_success(&url, &response, written.as_deref());
                }
                Err(e) => {
                    let tag = if e.is_cancelled() {
                        "cancelled".yellow()
                    } else {
                        "failed".red()
                    };
                    bar.abandon_with_message(tag.to_string());
                    report_failure(&url, &e);
                    failures.push(e);
                }
            }
        }

        match failures.len() {
            0 => Ok(()),
            n => {
                eprintln!(
                    "{} {} of {} fetches did not succeed",
                    "==>".bold().red(),
                    n,
                    self.urls.len()
                );
                Err(failures.swap_remove(0))
            }
        }
    }

    fn validator(&self) -> HttpResponseValidator {
        let validator = HttpResponseValidator::new();
        if self.accept.is_empty() {
            validator
        } else {
            validator.with_content_types(self.accept.iter().map(String::as_str))
        }
    }
}

async fn write_body(dir: &Path, name: &str, response: &FetchResponse) -> Result<PathBuf> {
    let path = dir.join(name);
    tokio::fs::write(&path, &response.data).await?;
    debug!("Wrote {} bytes to {}", response.data.len(), path.display());
    Ok(path)
}

fn report_success(url: &str, response: &FetchResponse, written: Option<&Path>) {
    let mime = response
        .response
        .essence()
        .unwrap_or_else(|| "unknown type".to_string());
    let status = response
        .response
        .status
        .map(|s| format!(", HTTP {s}"))
        .unwrap_or_default();
    let target = written
        .map(|p| format!(" -> {}", p.display()))
        .unwrap_or_default();
    println!(
        "{} {} ({} bytes, {}{}){}",
        "ok".green().bold(),
        url,
        response.data.len(),
        mime,
        status,
        target
    );
}

fn report_failure(url: &str, err: &FetchError) {
    let tag = if err.is_cancelled() {
        "cancelled".yellow().bold()
    } else {
        "failed".red().bold()
    };
    println!("{tag} {url}: {err}");
}

/// Last path segment of `url`, or `image-<index>` with an extension sniffed
/// from the body.
fn file_name_for(url: &Url, index: usize, body: &[u8]) -> String {
    let from_path = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string);
    from_path.unwrap_or_else(|| match infer::get(body) {
        Some(kind) => format!("image-{index}.{}", kind.extension()),
        None => format!("image-{index}"),
    })
}

fn unique_name(name: String, index: usize, used: &mut HashSet<String>) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let prefixed = format!("{index}-{name}");
    used.insert(prefixed.clone());
    prefixed
}
