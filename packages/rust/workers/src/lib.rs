//! HTTP implementations of the stage workers.
//!
//! - [`HttpScraper`]: fetches a site, extracts company attributes and its
//!   contact form
//! - [`OpenRouterGenerator`]: writes the outreach message with an LLM
//! - [`HttpFormSubmitter`]: posts the planned payload to the form's target

mod http;
pub mod generate;
pub mod scrape;
pub mod submit;

pub use generate::OpenRouterGenerator;
pub use scrape::HttpScraper;
pub use submit::HttpFormSubmitter;
