#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Era {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const fn era(id: &'static str, name: &'static str, description: &'static str) -> Era {
    Era {
        id,
        name,
        description,
    }
}

pub static ERAS: &[Era] = &[
    era(
        "egypt",
        "Ancient Egypt",
        "A majestic scene in Ancient Egypt, with the Great Pyramids and Sphinx in the background. The person is a noble or pharaoh with ornate gold jewelry.",
    ),
    era(
        "renaissance",
        "Renaissance Italy",
        "A lush balcony in 15th-century Florence. Dressed in rich velvet garments in the style of a Da Vinci portrait.",
    ),
    era(
        "victorian",
        "Victorian London",
        "A foggy street with gas lamps. Wearing a sophisticated top hat or a detailed corset dress.",
    ),
    era(
        "cyberpunk",
        "Neon Future",
        "A rain-slicked cyberpunk street with towering neon signs. High-tech streetwear and cybernetic enhancements.",
    ),
    era(
        "samurai",
        "Feudal Japan",
        "A serene cherry blossom garden with a traditional pagoda. Dressed in samurai armor or a silk kimono.",
    ),
    era(
        "roaring20s",
        "Roaring 20s",
        "A vibrant jazz club. Dressed in a sharp tuxedo or a flapper dress with sequins and feathers.",
    ),
    era(
        "viking",
        "Viking Age",
        "A rugged Nordic fjord with majestic longships. Dressed in thick furs, leather tunics, and iron jewelry.",
    ),
    era(
        "maya",
        "Ancient Maya",
        "A lush jungle with stone pyramids. Adorned in ceremonial regalia with a feathered headdress and jade.",
    ),
    era(
        "wildwest",
        "Wild West",
        "A dusty frontier town. Dressed as a gunslinger with a leather duster and Stetson hat.",
    ),
    era(
        "greece",
        "Ancient Greece",
        "The sun-drenched Acropolis. Wearing a white chiton with gold embroidery and a laurel wreath.",
    ),
    era(
        "pirate",
        "Age of Piracy",
        "A Caribbean cove with a wooden galleon. Dressed as a pirate captain with a tricorn hat.",
    ),
    era(
        "medieval",
        "Medieval Knight",
        "A stone castle courtyard. Wearing shining plate armor and holding a ceremonial sword.",
    ),
    era(
        "spaceage",
        "Retro Space Age",
        "A 1950s vision of a moon base. Wearing a silver jumpsuit with a bubble helmet.",
    ),
    era(
        "woodstock",
        "1960s Psychedelia",
        "A music festival with colorful vans. Wearing tie-dye and round sunglasses.",
    ),
    era(
        "prehistoric",
        "Prehistoric Era",
        "A prehistoric landscape with ferns and a volcano. Dressed in primitive furs.",
    ),
    era(
        "noir",
        "Film Noir",
        "A shadowy detective office in 1940s LA. Dressed in a trench coat and fedora.",
    ),
    era(
        "steampunk",
        "Steampunk Workshop",
        "A workshop filled with brass gears. Wearing goggles and a leather apron.",
    ),
    era(
        "atlantis",
        "Lost City of Atlantis",
        "An underwater city ruins. Garments made of sea silk, pearls, and coral.",
    ),
    era(
        "mars",
        "Mars Colony 2150",
        "A futuristic colony on the red planet. Wearing a high-tech spacesuit.",
    ),
    era(
        "disco",
        "Disco Fever",
        "A 1970s disco dance floor. Wearing a sequined jumpsuit and platform shoes.",
    ),
    era(
        "frenchrev",
        "French Revolution",
        "18th-century Paris streets. Revolutionary attire with a cockade hat.",
    ),
];

pub fn all() -> &'static [Era] {
    ERAS
}

pub fn find(id: &str) -> Option<&'static Era> {
    let id = id.trim();
    ERAS.iter().find(|era| era.id.eq_ignore_ascii_case(id))
}
