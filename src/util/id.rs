use uuid::Uuid;

/// 客户端请求的关联 id（仅用于日志）。
pub fn request_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("req-{}", &s[..12])
}
