//! Short human-readable job id minting.
//!
//! Ids look like `umbral-quasar-3f9a1c`: two dictionary words plus a 6-char
//! hex suffix drawn from the OS CSPRNG. The words make ids memorable; the
//! 24 random suffix bits carry the collision resistance.

use rand::rngs::OsRng;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "apical", "arboreal", "austral", "axial", "barred", "basal", "benthic", "binary", "biotic",
    "boreal", "calcic", "carinate", "caudal", "celestial", "chiral", "ciliate", "circumpolar",
    "cislunar", "clonal", "cometary", "coronal", "cortical", "cosmic", "crested", "cryogenic",
    "crystalline", "cyanotic", "dendritic", "dermal", "diurnal", "dorsal", "dwarf", "eccentric",
    "ecliptic", "elliptic", "embryonic", "endemic", "eruptive", "estival", "faunal", "fibrous",
    "filamentous", "floral", "fluvial", "foliate", "fossil", "fungal", "galactic", "gaseous",
    "geminate", "germinal", "gibbous", "glacial", "globular", "gnarled", "granular", "gravid",
    "heliacal", "helical", "hibernal", "humoral", "hybrid", "igneous", "innate", "insular",
    "interstellar", "ionic", "iridescent", "keeled", "lanate", "larval", "lateral", "lenticular",
    "lichenous", "littoral", "lunar", "lustrous", "magnetic", "marine", "membranous", "meridian",
    "mitotic", "molecular", "montane", "mossy", "motile", "mycelial", "nacreous", "natal",
    "nebular", "neural", "niveous", "nocturnal", "nodal", "nuclear", "obsidian", "occipital",
    "oceanic", "ocular", "orbital", "osseous", "ovate", "palmate", "pelagic", "perihelial",
    "petrous", "photic", "pinnate", "planetary", "plasmid", "polar", "pollinated", "protean",
    "protozoal", "pulsating", "quantal", "radial", "radiant", "raptorial", "reticular", "riparian",
    "rostral", "saurian", "seismic", "sessile", "sidereal", "silvan", "solar", "somatic",
    "spectral", "spiral", "sporous", "stellar", "stelliform", "striated", "subalpine", "sylvan",
    "symbiotic", "synaptic", "telluric", "tidal", "transitory", "tropic", "tundral", "umbral",
    "vascular", "ventral", "vernal", "vestigial", "virid", "viscous", "volant", "zodiacal",
    "zonal", "zygotic",
];

const NOUNS: &[&str] = &[
    "aphelion", "archaea", "asteroid", "aurora", "axon", "bacillus", "badger", "barnacle",
    "bearing", "biome", "bittern", "bobcat", "bolide", "bryozoan", "cambium", "canopy",
    "capybara", "cardinal", "caribou", "cassowary", "cepheid", "chordate", "chromosome",
    "cilium", "comet", "condor", "copepod", "corolla", "corona", "cortex", "cosmos", "coyote",
    "crater", "crinoid", "cuttlefish", "cygnet", "cytoplasm", "darter", "diatom", "dingo",
    "dipper", "dunlin", "eclipse", "ecotone", "egret", "enzyme", "equinox", "ermine",
    "estuary", "falcon", "fathom", "fern", "finch", "firefly", "fjord", "flagellum", "fumarole",
    "galaxy", "gamete", "gannet", "gecko", "genome", "gibbon", "ginkgo", "glacier", "gnomon",
    "grouse", "gyre", "halo", "heron", "hyphae", "ibis", "isopod", "jackdaw", "jerboa",
    "kelp", "kestrel", "krill", "lagoon", "lamprey", "lemur", "lichen", "limpet", "lumen",
    "lynx", "macaque", "magnetar", "magpie", "mantis", "marmot", "marten", "meridian",
    "meteor", "microbe", "mollusk", "moraine", "moth", "mycelium", "narwhal", "nautilus",
    "nebula", "neuron", "newt", "nucleus", "ocelot", "orbit", "organelle", "osprey", "otter",
    "parallax", "parsec", "peptide", "perigee", "petrel", "photon", "phylum", "pine",
    "pipit", "plasmid", "plover", "polestar", "pulsar", "quasar", "raven", "reef", "ribosome",
    "rotifer", "sandpiper", "sapling", "serval", "shearwater", "shrike", "skink", "solstice",
    "spore", "starling", "stoat", "sunspot", "syzygy", "tanager", "tardigrade", "tern",
    "thicket", "transit", "tundra", "umbra", "vacuole", "vole", "wombat", "wren", "zenith",
    "zephyr", "zircon",
];

/// Mint a fresh job id. One of three word layouts is chosen uniformly so ids
/// do not all read adjective-first; the suffix always contributes 24 bits of
/// CSPRNG entropy.
pub fn mint_job_id() -> String {
    let mut rng = OsRng;
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u32 = rng.gen_range(0..0x0100_0000);

    let (first, second) = match rng.gen_range(0..3u8) {
        0 => (adj, noun),
        1 => (noun, adj),
        _ => {
            // Two distinct nouns; re-draw on self-collision.
            let mut alt = NOUNS[rng.gen_range(0..NOUNS.len())];
            while alt == noun {
                alt = NOUNS[rng.gen_range(0..NOUNS.len())];
            }
            (noun, alt)
        }
    };

    format!("{first}-{second}-{suffix:06x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_valid(id: &str) -> bool {
        if id.len() > 40 {
            return false;
        }
        let parts: Vec<&str> = id.split('-').collect();
        parts.len() == 3
            && parts[0].chars().all(|c| c.is_ascii_lowercase())
            && !parts[0].is_empty()
            && parts[1].chars().all(|c| c.is_ascii_lowercase())
            && !parts[1].is_empty()
            && parts[2].len() == 6
            && parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    #[test]
    fn minted_ids_match_contract() {
        for _ in 0..500 {
            let id = mint_job_id();
            assert!(is_valid(&id), "invalid id: {id}");
        }
    }

    #[test]
    fn dictionaries_are_well_formed() {
        for word in ADJECTIVES.iter().chain(NOUNS.iter()) {
            assert!(!word.is_empty());
            assert!(word.chars().all(|c| c.is_ascii_lowercase()), "bad word: {word}");
            // Longest pair plus suffix must stay within the 40-char cap.
            assert!(word.len() <= 16, "word too long: {word}");
        }
    }

    #[test]
    fn ids_are_not_constant() {
        let a = mint_job_id();
        let b = mint_job_id();
        let c = mint_job_id();
        assert!(!(a == b && b == c), "three identical ids in a row");
    }
}
