use crate::model::CharacterProfile;

/// Coarse time of day used to pick a journal voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=11 => TimeOfDay::Morning,
            12..=17 => TimeOfDay::Afternoon,
            _ => TimeOfDay::Evening,
        }
    }
}

fn city(location: &str) -> &str {
    match location {
        "new-york" => "New York",
        "la" => "LA",
        other if !other.is_empty() => other,
        _ => "the city",
    }
}

/// Narrative journal text for the character's current day. The bands mirror
/// the difficulty tiers: overwhelmed in week one, finding footing through a
/// month, confident by two, at home after.
pub fn entry_text(day_number: i64, profile: &CharacterProfile, time: TimeOfDay) -> String {
    let city = city(&profile.location);
    if day_number <= 7 {
        match time {
            TimeOfDay::Morning => format!(
                "Day {} in {}\n\nWoke up to sirens and car horns again. Everyone out there seems \
                 to know exactly where they're going except me. Need coffee before I can face \
                 another day of nodding along to conversations I half catch.",
                day_number, city
            ),
            TimeOfDay::Afternoon => format!(
                "Day {} in {}\n\nLunch alone again, watching coworkers laugh at jokes I can't \
                 quite follow. Someone's walking over to my table. Deep breath.",
                day_number, city
            ),
            TimeOfDay::Evening => format!(
                "Day {} in {}\n\nExhausted doesn't begin to cover it. Every conversation feels \
                 like running a mental marathon. But I made it through another day.",
                day_number, city
            ),
        }
    } else if day_number <= 30 {
        match time {
            TimeOfDay::Morning => format!(
                "Day {} in {}\n\nStarting to find my rhythm. The barista knows my order now - \
                 small victory. Big meeting today and I actually have ideas to contribute.",
                day_number, city
            ),
            TimeOfDay::Afternoon => format!(
                "Day {} in {}\n\nMade a joke at team lunch that actually landed. Sure, I \
                 rehearsed it in my head first, but progress is progress.",
                day_number, city
            ),
            TimeOfDay::Evening => format!(
                "Day {} in {}\n\nThe words come easier now. Not easy, but easier. Even ordered \
                 takeout over the phone without rehearsing first.",
                day_number, city
            ),
        }
    } else if day_number <= 60 {
        format!(
            "Day {} in {}\n\n{} mornings hit different now. I have my spots, my people, my \
             routine. The anxiety is still there, just quieter. Leading today's standup - six \
             weeks ago that would've terrified me.",
            day_number, city, city
        )
    } else {
        format!(
            "Day {} in {}\n\n{} is home now. That's wild to write, but it's true. Today someone \
             asked ME for directions and got the full local treatment. Time to live here, not \
             just practice living here.",
            day_number, city, city
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CharacterProfile {
        CharacterProfile::new("u1", "new-york", "25-34", "female")
    }

    #[test]
    fn test_time_of_day_from_hour() {
        assert_eq!(TimeOfDay::from_hour(8), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(19), TimeOfDay::Evening);
    }

    #[test]
    fn test_bands_track_day_number() {
        let p = profile();
        let early = entry_text(3, &p, TimeOfDay::Evening);
        let footing = entry_text(20, &p, TimeOfDay::Evening);
        let confident = entry_text(45, &p, TimeOfDay::Morning);
        let home = entry_text(90, &p, TimeOfDay::Morning);
        assert!(early.contains("Day 3"));
        assert!(footing.contains("easier"));
        assert!(confident.contains("standup"));
        assert!(home.contains("home now"));
    }

    #[test]
    fn test_city_label() {
        let p = profile();
        assert!(entry_text(1, &p, TimeOfDay::Morning).contains("New York"));

        let unknown = CharacterProfile::new("u1", "", "25-34", "female");
        assert!(entry_text(1, &unknown, TimeOfDay::Morning).contains("the city"));
    }
}
