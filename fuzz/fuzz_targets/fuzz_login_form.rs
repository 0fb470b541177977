#![no_main]

//! Login form bodies and error messages from the query string are attacker
//! controlled. Decoding must not panic and rendering must not emit markup.

use authgate::auth::{error_param, parse_login_form};
use authgate::login_page::LoginPage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let (username, password) = parse_login_form(data);
    let _ = (username.len(), password.len());

    let query = String::from_utf8_lossy(data);
    if let Some(message) = error_param(Some(&query)) {
        let page = LoginPage::new(Some("<p>{{errormessage}}</p>".to_string()));
        let html = page.render(Some(&message));
        let inner = &html["<p>".len()..html.len() - "</p>".len()];
        assert!(!inner.contains('<'));
        assert!(!inner.contains('>'));
    }
});
