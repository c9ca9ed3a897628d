use mstache::{Image, RenderHandler, Result, Section};

/// Renders a fixed context: `name` is a scalar, `items` is a small array.
struct Greeting {
    items: Vec<&'static str>,
    out: String,
}

impl RenderHandler<usize> for Greeting {
    fn on_arg(&mut self, section: &mut Section<'_, usize>, name: &[u8], _escape: bool) -> Result<()> {
        match name {
            b"name" => self.out.push_str("world"),
            b"." => self.out.push_str(self.items[*section.udata()]),
            _ => {}
        }
        Ok(())
    }

    fn on_text(&mut self, _section: &mut Section<'_, usize>, text: &[u8]) -> Result<()> {
        self.out.push_str(&String::from_utf8_lossy(text));
        Ok(())
    }

    fn on_section_test(
        &mut self,
        _section: &mut Section<'_, usize>,
        name: &[u8],
        _callable: bool,
    ) -> Result<u32> {
        Ok(if name == b"items" {
            self.items.len() as u32
        } else {
            0
        })
    }

    fn on_section_start(
        &mut self,
        section: &mut Section<'_, usize>,
        _name: &[u8],
        index: u32,
    ) -> Result<()> {
        *section.udata_mut() = index as usize;
        Ok(())
    }
}

fn main() {
    env_logger::init();

    let image = Image::compile_source(
        "greeting",
        b"Hello, {{name}}!{{#items}} [{{.}}]{{/items}}\n",
    )
    .unwrap();

    let mut handler = Greeting {
        items: vec!["one", "two", "three"],
        out: String::new(),
    };
    image.render(&mut handler, 0).unwrap();

    print!("{}", handler.out);
}
