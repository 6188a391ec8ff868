// Rendering contract and cache behavior through the public API.

use serde_json::json;

use courier_server::model::{Channel, Metadata, NotificationTemplate, NotificationType};
use courier_server::template::{render, TemplateCache};

fn welcome_template() -> NotificationTemplate {
    NotificationTemplate {
        notification_type: NotificationType::Welcome,
        channel: Channel::Email,
        title: "Welcome, {{userName}}!".to_string(),
        message: "Hi {{userName}}, thanks for joining.".to_string(),
        html_content: Some("<h1>Welcome {{userName}}</h1><p>{{message}}</p>".to_string()),
    }
}

#[test]
fn rendering_with_no_variables_returns_template_unchanged() {
    let template = welcome_template();
    let rendered = render(&template, &Metadata::new());
    assert_eq!(rendered.title, template.title);
    assert_eq!(rendered.message, template.message);
    assert_eq!(rendered.html_content, template.html_content);
}

#[test]
fn rendering_substitutes_every_field() {
    let template = welcome_template();
    let variables: Metadata = [
        ("userName".to_string(), json!("Ada")),
        ("message".to_string(), json!("enjoy your stay")),
    ]
    .into_iter()
    .collect();

    let rendered = render(&template, &variables);
    assert_eq!(rendered.title, "Welcome, Ada!");
    assert_eq!(rendered.message, "Hi Ada, thanks for joining.");
    assert_eq!(
        rendered.html_content.as_deref(),
        Some("<h1>Welcome Ada</h1><p>enjoy your stay</p>")
    );
}

#[test]
fn rendering_twice_is_stable() {
    let template = welcome_template();
    let variables: Metadata = [("userName".to_string(), json!("Ada"))].into_iter().collect();

    let once = render(&template, &variables);
    let twice = render(
        &NotificationTemplate {
            notification_type: template.notification_type.clone(),
            channel: template.channel,
            title: once.title.clone(),
            message: once.message.clone(),
            html_content: once.html_content.clone(),
        },
        &variables,
    );

    assert_eq!(once.title, twice.title);
    assert_eq!(once.message, twice.message);
    assert_eq!(once.html_content, twice.html_content);
}

#[tokio::test]
async fn cache_hit_returns_inserted_template() {
    let cache = TemplateCache::new();
    cache.insert(welcome_template()).await;

    let hit = cache.get(&NotificationType::Welcome, Channel::Email).await;
    assert!(hit.is_some());
    assert_eq!(hit.unwrap().title, "Welcome, {{userName}}!");

    let miss = cache.get(&NotificationType::Welcome, Channel::Push).await;
    assert!(miss.is_none());
}
