//! Weather lookup tool — deterministic offline weather.
//!
//! Returns plausible weather derived from the location name so the agent
//! loop can be exercised end-to-end without network access.

use async_trait::async_trait;
use serde::Serialize;
use stepwise_core::error::ToolError;
use stepwise_core::tool::{Tool, ToolOutput};
use stepwise_core::AbortSignal;

pub struct WeatherLookupTool;

#[async_trait]
impl Tool for WeatherLookupTool {
    fn name(&self) -> &str {
        "weather_lookup"
    }

    fn description(&self) -> &str {
        "Look up current weather conditions for a location. Returns temperature, conditions, humidity, and wind speed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The city name or location to look up weather for"
                },
                "units": {
                    "type": "string",
                    "enum": ["metric", "imperial"],
                    "description": "Temperature units (default: metric)"
                }
            },
            "required": ["location"],
            "additionalProperties": false
        })
    }

    async fn run(
        &self,
        input: serde_json::Value,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput, ToolError> {
        let location = input["location"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput {
                tool_name: self.name().into(),
                reason: "missing 'location'".into(),
            })?;
        let units = input["units"].as_str().unwrap_or("metric");

        let weather = mock_weather(location, units);
        let data = serde_json::to_value(&weather)
            .map_err(|e| ToolError::failed(self.name(), e.to_string()))?;
        Ok(ToolOutput::json(data))
    }
}

#[derive(Serialize)]
struct WeatherData {
    location: String,
    temperature: f64,
    units: &'static str,
    conditions: &'static str,
    humidity: u32,
    wind_speed: f64,
    wind_direction: &'static str,
}

/// Same location, same weather.
fn mock_weather(location: &str, units: &str) -> WeatherData {
    let hash: u32 = location
        .to_lowercase()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));

    const CONDITIONS: [&str; 8] = [
        "Clear skies",
        "Partly cloudy",
        "Overcast",
        "Light rain",
        "Heavy rain",
        "Thunderstorms",
        "Snow",
        "Foggy",
    ];
    const WIND: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];

    let celsius = ((hash % 40) as f64) - 5.0;
    let (temperature, units) = if units == "imperial" {
        (celsius * 9.0 / 5.0 + 32.0, "°F")
    } else {
        (celsius, "°C")
    };

    WeatherData {
        location: location.to_string(),
        temperature: (temperature * 10.0).round() / 10.0,
        units,
        conditions: CONDITIONS[(hash as usize / 7) % CONDITIONS.len()],
        humidity: 30 + (hash % 60),
        wind_speed: ((hash % 30) as f64) + 5.0,
        wind_direction: WIND[(hash as usize / 3) % WIND.len()],
    }
}
