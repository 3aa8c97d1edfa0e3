fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("invalid {key}={raw}, ignoring");
            None
        }
    }
}

pub(crate) fn env_usize(key: &str) -> Option<usize> {
    env_parse(key)
}

pub(crate) fn env_f64(key: &str) -> Option<f64> {
    env_parse::<f64>(key).filter(|value| {
        let finite = value.is_finite();
        if !finite {
            log::warn!("non-finite {key}={value}, ignoring");
        }
        finite
    })
}
