//! Login form rendering.
//!
//! The page is either the built-in form or an operator-supplied template.
//! Templates mark where the error text goes with `{{errormessage}}`; the text
//! is HTML-escaped before substitution since it arrives in a query parameter.

use std::path::Path;

use crate::config::ConfigError;

/// Placeholder replaced with the escaped error message.
pub const ERROR_PLACEHOLDER: &str = "{{errormessage}}";

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Login</title>
<style>
body { font-family: sans-serif; background: #f4f5f7; display: flex; justify-content: center; align-items: center; min-height: 100vh; margin: 0; }
form { background: #fff; padding: 2em; border-radius: 6px; box-shadow: 0 1px 4px rgba(0,0,0,.15); width: 18em; }
label, input { display: block; width: 100%; box-sizing: border-box; }
input { margin: .3em 0 1em; padding: .5em; }
.error { color: #b00020; min-height: 1.2em; }
</style>
</head>
<body>
<form method="post" action="/login">
<h2>Sign in</h2>
<p class="error">{{errormessage}}</p>
<label for="username">Username</label>
<input id="username" name="username" type="text" autocomplete="username" required autofocus>
<label for="password">Password</label>
<input id="password" name="password" type="password" autocomplete="current-password" required>
<input type="submit" value="Login">
</form>
</body>
</html>
"#;

/// Read a template file and check it has the error placeholder.
pub fn load_template(path: &Path) -> Result<String, ConfigError> {
    let template = std::fs::read_to_string(path).map_err(|e| ConfigError::LoginTemplate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !template.contains(ERROR_PLACEHOLDER) {
        return Err(ConfigError::LoginTemplate {
            path: path.to_path_buf(),
            reason: format!("missing {ERROR_PLACEHOLDER} placeholder"),
        });
    }
    Ok(template)
}

/// Renders the login page.
#[derive(Debug, Clone)]
pub struct LoginPage {
    template: String,
}

impl Default for LoginPage {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl LoginPage {
    pub fn new(template: Option<String>) -> Self {
        template.map(|template| Self { template }).unwrap_or_default()
    }

    /// Render the page with an optional error message.
    pub fn render(&self, error: Option<&str>) -> String {
        self.template
            .replace(ERROR_PLACEHOLDER, &escape_html(error.unwrap_or_default()))
    }
}

/// Escape text for inclusion in HTML element content or quoted attributes.
pub fn escape_html(input: &str) -> String {
    html_escape::encode_safe(input).into_owned()
}
