//! Contact form classification and submission payload construction.
//!
//! Exclusion rules run first and are absolute: a form that looks like search,
//! newsletter signup, postal-code lookup or login is never submitted to. Each
//! remaining field is matched against ordered category rules on its combined
//! name, id and placeholder text; the first matching rule wins.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use outreach_shared::{FieldKind, FormDescriptor, FormField, SenderConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a form field asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Name,
    Email,
    Phone,
    Subject,
    Message,
    Company,
    Website,
}

/// Everything the form submitter needs for one POST/GET.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPlan {
    /// Field name to the category it was classified as.
    pub field_mapping: BTreeMap<String, FieldCategory>,
    /// Field name to the value sent. Persisted verbatim as the submitted fields.
    pub payload: BTreeMap<String, String>,
    pub submit_url: String,
    /// `get` or `post`.
    pub method: String,
}

/// Why a form will not be submitted to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormRejection {
    /// Not a contact form at all. Closes the entity as NO_FORM_FOUND.
    #[error("not a contact form: {0}")]
    NotContactForm(&'static str),
    #[error("no mappable fields")]
    NoMappableFields,
    #[error("invalid form target: {0}")]
    InvalidTarget(String),
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Exclusion keywords match whole tokens of the lowercased caption, action,
/// id and class: "site-search" and "login_form" hit, "research" and
/// "account manager" do not.
static EXCLUSIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"search(?:form|box|bar)?", "search form"),
        (
            r"newsletters?|subscribe|mailing[-_ ]?list",
            "newsletter signup",
        ),
        (r"postal|post[-_ ]?code|zip[-_ ]?code", "postal code lookup"),
        (
            r"log[-_ ]?in|sign[-_ ]?in|password|credentials?|register|registration|(?:create|new|my)[-_ ]?account",
            "login form",
        ),
    ]
    .into_iter()
    .map(|(words, reason)| {
        let re = format!(r"(?:^|[^a-z])(?:{words})(?:[^a-z]|$)");
        (Regex::new(&re).expect("valid regex"), reason)
    })
    .collect()
});

static CATEGORY_RULES: LazyLock<Vec<(FieldCategory, Regex)>> = LazyLock::new(|| {
    [
        (FieldCategory::Name, r"name|nombre"),
        (FieldCategory::Email, r"e-?mail"),
        (FieldCategory::Phone, r"phone|mobile|(^|[^a-z])tel([^a-z]|$)"),
        (FieldCategory::Subject, r"subject|topic|regarding"),
        (
            FieldCategory::Message,
            r"message|comment|inquiry|enquiry|question|details|(^|[^a-z])msg",
        ),
        (FieldCategory::Company, r"company|organi[sz]ation|business"),
        (FieldCategory::Website, r"website|web[-_ ]?site|homepage|url|domain"),
    ]
    .into_iter()
    .map(|(cat, re)| (cat, Regex::new(re).expect("valid regex")))
    .collect()
});

/// "Company name" must not be classified as the sender's name.
static ORG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"company|organi[sz]ation|business").expect("valid regex"));

static FIRST_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"first|fname|given").expect("valid regex"));

static LAST_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"last|lname|surname|family").expect("valid regex"));

/// Why `form` is not a contact form, if it is not one.
pub fn exclusion_reason(form: &FormDescriptor) -> Option<&'static str> {
    if form.fields.iter().any(|f| f.kind == FieldKind::Password) {
        return Some("login form");
    }
    let haystack = [&form.caption, &form.action, &form.id, &form.class]
        .into_iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    EXCLUSIONS
        .iter()
        .find(|(re, _)| re.is_match(&haystack))
        .map(|(_, reason)| *reason)
}

pub fn is_contact_form(form: &FormDescriptor) -> bool {
    exclusion_reason(form).is_none()
        && form.fields.iter().any(|f| classify_field(f).is_some())
}

/// Category of a visible field, first matching rule wins.
pub fn classify_field(field: &FormField) -> Option<FieldCategory> {
    if matches!(
        field.kind,
        FieldKind::Hidden | FieldKind::Password | FieldKind::Checkbox | FieldKind::Radio
    ) {
        return None;
    }
    let text = [Some(&field.name), field.id.as_ref(), field.placeholder.as_ref()]
        .into_iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let by_text = CATEGORY_RULES
        .iter()
        .filter(|(cat, _)| *cat != FieldCategory::Name || !ORG_RE.is_match(&text))
        .find(|(_, re)| re.is_match(&text))
        .map(|(cat, _)| *cat);

    by_text.or(match field.kind {
        FieldKind::Email => Some(FieldCategory::Email),
        FieldKind::Tel => Some(FieldCategory::Phone),
        FieldKind::Url => Some(FieldCategory::Website),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Payload construction
// ---------------------------------------------------------------------------

/// Build the submission for `form` carrying `message` from `sender`.
pub fn plan_submission(
    form: &FormDescriptor,
    message: &str,
    sender: &SenderConfig,
) -> Result<SubmissionPlan, FormRejection> {
    if let Some(reason) = exclusion_reason(form) {
        return Err(FormRejection::NotContactForm(reason));
    }

    let mut field_mapping = BTreeMap::new();
    let mut payload = BTreeMap::new();

    for field in form.fields.iter().filter(|f| !f.name.is_empty()) {
        if field.kind == FieldKind::Hidden {
            if let Some(value) = &field.value {
                payload.insert(field.name.clone(), value.clone());
            }
            continue;
        }
        match classify_field(field) {
            Some(category) => {
                field_mapping.insert(field.name.clone(), category);
                payload.insert(
                    field.name.clone(),
                    category_value(category, field, message, sender),
                );
            }
            None if field.required => {
                if let Some(value) = default_value(field, message) {
                    payload.insert(field.name.clone(), value);
                }
            }
            None => {}
        }
    }

    if field_mapping.is_empty() {
        return Err(FormRejection::NoMappableFields);
    }

    Ok(SubmissionPlan {
        field_mapping,
        payload,
        submit_url: submit_url(form)?,
        method: if form.method.eq_ignore_ascii_case("get") {
            "get".into()
        } else {
            "post".into()
        },
    })
}

fn category_value(
    category: FieldCategory,
    field: &FormField,
    message: &str,
    sender: &SenderConfig,
) -> String {
    match category {
        FieldCategory::Name => {
            let text = format!("{} {}", field.name, field.id.as_deref().unwrap_or_default())
                .to_lowercase();
            let (first, last) = sender
                .name
                .split_once(' ')
                .unwrap_or((sender.name.as_str(), ""));
            if FIRST_NAME_RE.is_match(&text) {
                first.to_string()
            } else if LAST_NAME_RE.is_match(&text) && !last.is_empty() {
                last.to_string()
            } else {
                sender.name.clone()
            }
        }
        FieldCategory::Email => sender.email.clone(),
        FieldCategory::Phone => sender.phone.clone(),
        FieldCategory::Subject => sender.subject.clone(),
        FieldCategory::Message => message.to_string(),
        FieldCategory::Company => sender.company.clone(),
        FieldCategory::Website => sender.website.clone(),
    }
}

/// Deterministic value for a required field no rule matched.
fn default_value(field: &FormField, message: &str) -> Option<String> {
    match field.kind {
        FieldKind::Textarea => Some(message.to_string()),
        FieldKind::Select | FieldKind::Radio => field.options.first().cloned(),
        FieldKind::Checkbox => Some(field.value.clone().unwrap_or_else(|| "on".into())),
        FieldKind::Number => Some(field.placeholder.clone().unwrap_or_else(|| "1".into())),
        FieldKind::Password | FieldKind::Hidden => None,
        _ => Some(
            field
                .placeholder
                .clone()
                .or_else(|| field.value.clone())
                .unwrap_or_else(|| "N/A".into()),
        ),
    }
}

fn submit_url(form: &FormDescriptor) -> Result<String, FormRejection> {
    let page = Url::parse(&form.page_url)
        .map_err(|e| FormRejection::InvalidTarget(format!("{}: {e}", form.page_url)))?;
    let target = match form.action.as_deref().map(str::trim) {
        Some(action) if !action.is_empty() => page
            .join(action)
            .map_err(|e| FormRejection::InvalidTarget(format!("{action}: {e}")))?,
        _ => page,
    };
    if !matches!(target.scheme(), "http" | "https") {
        return Err(FormRejection::InvalidTarget(target.to_string()));
    }
    Ok(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{contact_form, field};

    fn sender() -> SenderConfig {
        SenderConfig {
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
            phone: "+44 20 0000 0000".into(),
            company: "Analytical Engines".into(),
            website: "https://engines.example".into(),
            subject: "Partnership inquiry".into(),
        }
    }

    #[test]
    fn classifies_by_ordered_rules() {
        let mut company = field("company_name", FieldKind::Text, false);
        assert_eq!(classify_field(&company), Some(FieldCategory::Company));
        company.name = "organization".into();
        assert_eq!(classify_field(&company), Some(FieldCategory::Company));

        assert_eq!(
            classify_field(&field("your-name", FieldKind::Text, true)),
            Some(FieldCategory::Name)
        );
        assert_eq!(
            classify_field(&field("contact_email", FieldKind::Text, true)),
            Some(FieldCategory::Email)
        );
        assert_eq!(
            classify_field(&field("tel", FieldKind::Text, false)),
            Some(FieldCategory::Phone)
        );
        assert_eq!(
            classify_field(&field("hotel", FieldKind::Text, false)),
            None
        );
        assert_eq!(
            classify_field(&field("field_7", FieldKind::Email, false)),
            Some(FieldCategory::Email)
        );

        let mut placeholder_only = field("f1", FieldKind::Textarea, true);
        placeholder_only.placeholder = Some("How can we help? Your message".into());
        assert_eq!(classify_field(&placeholder_only), Some(FieldCategory::Message));
    }

    #[test]
    fn exclusions_are_absolute() {
        let mut search = contact_form("https://acme.test/");
        search.id = Some("site-search".into());
        assert_eq!(exclusion_reason(&search), Some("search form"));

        let mut newsletter = contact_form("https://acme.test/");
        newsletter.caption = Some("Subscribe to our newsletter".into());
        assert_eq!(
            plan_submission(&newsletter, "hi", &sender()),
            Err(FormRejection::NotContactForm("newsletter signup"))
        );

        let mut login = contact_form("https://acme.test/");
        login.fields.push(field("pwd", FieldKind::Password, true));
        assert_eq!(exclusion_reason(&login), Some("login form"));

        assert_eq!(exclusion_reason(&contact_form("https://acme.test/")), None);
    }

    #[test]
    fn exclusions_match_whole_words_only() {
        let mut form = contact_form("https://acme.test/");
        form.caption = Some("Contact our research team".into());
        assert_eq!(exclusion_reason(&form), None);
        assert!(is_contact_form(&form));

        form.caption = Some("Talk to your account manager".into());
        form.class = Some("registered-office subscription-question".into());
        assert_eq!(exclusion_reason(&form), None);

        form.class = Some("wp-block searchform".into());
        assert_eq!(exclusion_reason(&form), Some("search form"));

        form.class = None;
        form.action = Some("/account/login_check".into());
        assert_eq!(exclusion_reason(&form), Some("login form"));

        form.action = Some("/create-account".into());
        assert_eq!(exclusion_reason(&form), Some("login form"));
    }

    #[test]
    fn builds_payload_for_contact_form() {
        let form = contact_form("https://acme.test/contact");
        let plan = plan_submission(&form, "Hello Acme", &sender()).unwrap();

        assert_eq!(plan.submit_url, "https://acme.test/contact/send");
        assert_eq!(plan.method, "post");
        assert_eq!(plan.payload["your-name"], "Ada Lovelace");
        assert_eq!(plan.payload["your-email"], "ada@example.com");
        assert_eq!(plan.payload["your-message"], "Hello Acme");
        assert_eq!(plan.field_mapping["your-message"], FieldCategory::Message);
    }

    #[test]
    fn required_uncategorized_fields_get_defaults() {
        let mut form = contact_form("https://acme.test/contact");
        form.action = None;
        form.method = "GET".into();

        let mut budget = field("budget", FieldKind::Select, true);
        budget.options = vec!["< 10k".into(), "10k+".into()];
        let mut referral = field("ref", FieldKind::Text, true);
        referral.placeholder = Some("How did you hear about us?".into());
        let mut token = field("_token", FieldKind::Hidden, false);
        token.value = Some("abc123".into());
        let consent = field("gdpr", FieldKind::Checkbox, true);
        let optional = field("notes2", FieldKind::Text, false);
        form.fields.extend([budget, referral, token, consent, optional]);

        let plan = plan_submission(&form, "Hello", &sender()).unwrap();
        assert_eq!(plan.submit_url, "https://acme.test/contact");
        assert_eq!(plan.method, "get");
        assert_eq!(plan.payload["budget"], "< 10k");
        assert_eq!(plan.payload["ref"], "How did you hear about us?");
        assert_eq!(plan.payload["_token"], "abc123");
        assert_eq!(plan.payload["gdpr"], "on");
        assert!(!plan.payload.contains_key("notes2"));
        assert!(!plan.field_mapping.contains_key("budget"));
    }

    #[test]
    fn split_name_fields() {
        let mut form = contact_form("https://acme.test/contact");
        form.fields = vec![
            field("first_name", FieldKind::Text, true),
            field("last_name", FieldKind::Text, true),
            field("email", FieldKind::Email, true),
        ];
        let plan = plan_submission(&form, "Hello", &sender()).unwrap();
        assert_eq!(plan.payload["first_name"], "Ada");
        assert_eq!(plan.payload["last_name"], "Lovelace");
    }

    #[test]
    fn no_mappable_fields_is_rejected() {
        let mut form = contact_form("https://acme.test/contact");
        form.fields = vec![field("x1", FieldKind::Text, false), field("x2", FieldKind::Checkbox, true)];
        assert_eq!(
            plan_submission(&form, "Hello", &sender()),
            Err(FormRejection::NoMappableFields)
        );
        assert!(!is_contact_form(&form));
    }
}
