/// HTTP error category for user-facing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorCategory {
    Client,    // 4xx errors
    Server,    // 5xx errors
    Auth,      // 401, 403
    RateLimit, // 429
    Other,     // 1xx/2xx/3xx that are not a plain 200
}

/// Readable description of a status code returned by a song or cover host
#[derive(Debug, Clone)]
pub struct HttpErrorInfo {
    pub status_code: u16,
    pub category: HttpErrorCategory,
    pub description: String,
}

impl HttpErrorInfo {
    pub fn from_status(status: u16) -> Self {
        let (category, description) = match status {
            400 => (HttpErrorCategory::Client, "Bad Request".to_string()),
            401 => (HttpErrorCategory::Auth, "Unauthorized".to_string()),
            403 => (HttpErrorCategory::Auth, "Forbidden".to_string()),
            404 => (HttpErrorCategory::Client, "Not Found".to_string()),
            410 => (HttpErrorCategory::Client, "Gone".to_string()),
            429 => (HttpErrorCategory::RateLimit, "Too Many Requests".to_string()),
            500 => (HttpErrorCategory::Server, "Internal Server Error".to_string()),
            502 => (HttpErrorCategory::Server, "Bad Gateway".to_string()),
            503 => (HttpErrorCategory::Server, "Service Unavailable".to_string()),
            504 => (HttpErrorCategory::Server, "Gateway Timeout".to_string()),
            206 => (HttpErrorCategory::Other, "Partial Content".to_string()),
            _ if (400..500).contains(&status) => {
                (HttpErrorCategory::Client, format!("Client Error ({})", status))
            }
            _ if status >= 500 => (HttpErrorCategory::Server, format!("Server Error ({})", status)),
            _ => (HttpErrorCategory::Other, format!("Unexpected Status ({})", status)),
        };

        Self {
            status_code: status,
            category,
            description,
        }
    }

    /// Format for display
    pub fn format(&self) -> String {
        format!("HTTP {} - {}", self.status_code, self.description)
    }
}
