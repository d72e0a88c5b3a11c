//! Borrowed object model produced by the parser. Values reference the input
//! buffer; only decoded names allocate.

#[derive(Debug, Clone)]
pub struct PdfName {
    /// Decoded name bytes including the leading slash, `#xx` escapes resolved.
    pub decoded: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PdfDict<'a> {
    pub entries: Vec<(PdfName, PdfObj<'a>)>,
}

#[derive(Debug, Clone)]
pub struct PdfStream<'a> {
    pub dict: PdfDict<'a>,
    /// Raw stream body, strictly between `stream` and `endstream`.
    pub data: &'a [u8],
}

#[derive(Debug, Clone)]
pub enum PdfAtom<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Name(PdfName),
    /// Raw string bytes including the delimiters; never interpreted here.
    Str(&'a [u8]),
    Array(Vec<PdfObj<'a>>),
    Dict(PdfDict<'a>),
    Stream(PdfStream<'a>),
    Ref { obj: u32, gen: u16 },
}

#[derive(Debug, Clone)]
pub struct PdfObj<'a> {
    pub atom: PdfAtom<'a>,
}

impl<'a> PdfDict<'a> {
    pub fn get_first(&self, name: &[u8]) -> Option<&PdfObj<'a>> {
        self.entries
            .iter()
            .find(|(k, _)| k.decoded.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn has_name(&self, key: &[u8], value: &[u8]) -> bool {
        matches!(
            self.get_first(key),
            Some(PdfObj { atom: PdfAtom::Name(n) }) if n.decoded.eq_ignore_ascii_case(value)
        )
    }

    pub fn int(&self, key: &[u8]) -> Option<i64> {
        match self.get_first(key)?.atom {
            PdfAtom::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn uint(&self, key: &[u8]) -> Option<u64> {
        match self.int(key)? {
            v if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn reference(&self, key: &[u8]) -> Option<(u32, u16)> {
        match self.get_first(key)?.atom {
            PdfAtom::Ref { obj, gen } => Some((obj, gen)),
            _ => None,
        }
    }

    pub fn name(&self, key: &[u8]) -> Option<&[u8]> {
        match &self.get_first(key)?.atom {
            PdfAtom::Name(n) => Some(&n.decoded),
            _ => None,
        }
    }
}

impl<'a> PdfObj<'a> {
    pub fn as_dict(&self) -> Option<&PdfDict<'a>> {
        match &self.atom {
            PdfAtom::Dict(d) => Some(d),
            PdfAtom::Stream(st) => Some(&st.dict),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&PdfStream<'a>> {
        match &self.atom {
            PdfAtom::Stream(st) => Some(st),
            _ => None,
        }
    }
}
