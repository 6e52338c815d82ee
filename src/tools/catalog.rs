//! Financial tool catalog
//!
//! Schemas for the market-data, news and portfolio capabilities the
//! assistant can call, plus an HTTP handler that forwards validated
//! arguments to the financial API service.

use super::{ToolArguments, ToolHandler, ToolRegistry};
use crate::error::EngineError;
use crate::models::{ParamType, ToolSchema};
use crate::Result;
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SYMBOL: &str = "The stock ticker symbol (e.g., AAPL for Apple, MSFT for Microsoft).";
const PORTFOLIO_NAME: &str = "The name of the portfolio. Use if portfolio_id is not known.";
const PORTFOLIO_ID: &str = "The unique ID of the portfolio. Preferred if known.";

/// Every tool the assistant can call, in prompt order.
pub fn financial_tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new(
            "get_stock_price",
            "Fetches the current trading price for a company's stock symbol. Use this for \
             company stocks ONLY, never for cryptocurrencies.",
        )
        .param("symbol", ParamType::String, true, SYMBOL),
        ToolSchema::new(
            "get_crypto_price",
            "Fetches the current price of a cryptocurrency (e.g., BTC, ETH) against a market \
             currency. Use this ONLY for cryptocurrencies.",
        )
        .param("symbol", ParamType::String, true, "The cryptocurrency symbol (e.g., BTC, ETH, SOL).")
        .param(
            "market",
            ParamType::String,
            false,
            "The currency to quote against (e.g., USD, EUR). Defaults to USD.",
        ),
        ToolSchema::new(
            "get_company_overview",
            "Retrieves company details: business description, sector, industry, market cap, \
             P/E, EPS and other key metrics.",
        )
        .param("symbol", ParamType::String, true, SYMBOL),
        ToolSchema::new(
            "get_financial_news",
            "Searches recent financial news about companies, cryptocurrencies or market topics.",
        )
        .param(
            "query",
            ParamType::String,
            true,
            "A specific news query (e.g., 'Tesla Q3 earnings'). Be specific.",
        )
        .param("limit", ParamType::Integer, false, "Maximum number of articles. Defaults to 3, max 5."),
        ToolSchema::new(
            "get_ticker_specific_news",
            "Fetches recent news articles about one ticker symbol (stock or crypto).",
        )
        .param("symbol", ParamType::String, true, "The ticker symbol (e.g., AAPL, BTC-USD).")
        .param("limit", ParamType::Integer, false, "Maximum number of articles. Defaults to 5."),
        ToolSchema::new(
            "explain_financial_concept",
            "Explains a financial concept, term or metric (e.g., P/E ratio, inflation, ETF).",
        )
        .param(
            "concept_name",
            ParamType::String,
            true,
            "The concept to explain (e.g., 'Market Capitalization').",
        ),
        ToolSchema::new(
            "general_web_search",
            "General web search for when no specialized tool fits, or to discover items \
             (e.g., 'top trending cryptocurrencies') to look up with other tools.",
        )
        .param("query", ParamType::String, true, "The search query."),
        ToolSchema::new(
            "get_historical_stock_data",
            "Fetches daily historical OHLCV data for a stock symbol.",
        )
        .param("symbol", ParamType::String, true, SYMBOL)
        .param(
            "outputsize",
            ParamType::String,
            false,
            "'compact' for the last 100 data points, 'full' for the complete history.",
        ),
        ToolSchema::new(
            "list_my_portfolios",
            "Lists all investment portfolios of the current user with their names and IDs.",
        ),
        ToolSchema::new(
            "get_portfolio_positions",
            "Lists positions (asset, quantity, average price) in one of the user's portfolios.",
        )
        .param("portfolio_name", ParamType::String, false, PORTFOLIO_NAME)
        .param("portfolio_id", ParamType::Integer, false, PORTFOLIO_ID),
        ToolSchema::new(
            "get_portfolio_market_value",
            "Calculates the current total market value of one of the user's portfolios.",
        )
        .param("portfolio_name", ParamType::String, false, PORTFOLIO_NAME)
        .param("portfolio_id", ParamType::Integer, false, PORTFOLIO_ID),
        ToolSchema::new(
            "get_portfolio_pnl",
            "Calculates unrealized profit and loss for one of the user's portfolios.",
        )
        .param("portfolio_name", ParamType::String, false, PORTFOLIO_NAME)
        .param("portfolio_id", ParamType::Integer, false, PORTFOLIO_ID),
    ]
}

/// Connection to the financial API service.
#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `FINANCIAL_API_BASE_URL` (or `TOOLS_API_BASE_URL`), if configured.
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("FINANCIAL_API_BASE_URL")
            .or_else(|_| env::var("TOOLS_API_BASE_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty())?;

        Self::new(base_url).ok()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json(&self, tool: &str, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "financial API request");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::ToolExecution {
                tool: tool.to_string(),
                message: if e.is_timeout() {
                    "the data provider timed out".to_string()
                } else {
                    "the data provider could not be reached".to_string()
                },
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|_| EngineError::ToolExecution {
                tool: tool.to_string(),
                message: format!("the data provider returned an unreadable response ({})", status),
            })?;

        if !status.is_success() {
            let detail = body
                .get("detail")
                .or_else(|| body.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("request failed with status {}", status));
            return Err(EngineError::ToolExecution {
                tool: tool.to_string(),
                message: detail,
            });
        }

        Ok(body)
    }
}

/// Forwards validated arguments to `{base}/tools/{name}`.
pub struct HttpToolHandler {
    api: FinancialApiClient,
    tool: String,
}

impl HttpToolHandler {
    pub fn new(api: FinancialApiClient, tool: impl Into<String>) -> Self {
        Self {
            api,
            tool: tool.into(),
        }
    }

    fn path(&self) -> String {
        format!("/tools/{}", self.tool)
    }
}

#[async_trait::async_trait]
impl ToolHandler for HttpToolHandler {
    async fn call(&self, args: ToolArguments) -> Result<Value> {
        self.api
            .post_json(&self.tool, &self.path(), &args.into_value())
            .await
    }
}

/// Register every catalog tool against the financial API service.
pub fn register_http_tools(registry: &mut ToolRegistry, api: &FinancialApiClient) -> Result<()> {
    let schemas = financial_tool_schemas();
    let count = schemas.len();

    for schema in schemas {
        let handler = Arc::new(HttpToolHandler::new(api.clone(), schema.name.clone()));
        registry.register(schema, handler)?;
    }

    info!(tools = count, base_url = %api.base_url(), "registered financial API tools");
    Ok(())
}
